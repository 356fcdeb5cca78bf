//! Terminal chat client: optimistic message delivery, concurrent attachment
//! uploads, push reconciliation and a retrying request gateway.

pub mod app;
pub mod attachments;
pub mod codec;
pub mod config;
pub mod error;
pub mod remote;
pub mod rooms;
pub mod ui;

#[cfg(test)]
mod testing;
