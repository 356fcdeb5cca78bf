//! Single-flight coordination for credential refresh.
//!
//! The first caller to hit a 401 becomes the leader and performs the refresh;
//! everyone arriving while it runs gets a waiter that resolves with the
//! leader's outcome. Releasing (explicitly or by dropping the guard) always
//! clears the flag and empties the queue.

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::AuthError;

pub type RefreshOutcome = Result<String, AuthError>;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

pub enum RefreshTicket<'a> {
    Leader(RefreshGuard<'a>),
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> RefreshTicket<'_> {
        let mut state = self.state.lock();
        if state.refreshing {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            RefreshTicket::Waiter(rx)
        } else {
            state.refreshing = true;
            RefreshTicket::Leader(RefreshGuard {
                coordinator: self,
                released: false,
            })
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().refreshing
    }

    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn release(&self, outcome: RefreshOutcome) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            state.refreshing = false;
            std::mem::take(&mut state.waiters)
        };

        let count = waiters.len();
        for waiter in waiters {
            // A waiter whose caller went away is fine to skip
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Held by the refresh leader. Dropping it without `release` rejects the queue.
pub struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    released: bool,
}

impl RefreshGuard<'_> {
    /// Hand the outcome to every queued caller. Returns how many were waiting.
    pub fn release(mut self, outcome: RefreshOutcome) -> usize {
        self.released = true;
        self.coordinator.release(outcome)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release(Err(AuthError::Interrupted));
        }
    }
}
