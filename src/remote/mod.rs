pub use gateway::{RequestGateway, RetryPolicy};
pub use profiles::ProfileDirectory;
pub use push::{LocalPushHub, PollingPushService, PushEvent, PushEventKind, PushService, PushSubscription};
pub use realtime::{BridgeContext, RealtimeBridge};
pub use refresh::{RefreshCoordinator, RefreshGuard, RefreshTicket};
pub use session::{Session, SessionStore};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, RequestBody, ReqwestTransport};

mod gateway;
mod profiles;
mod push;
mod realtime;
mod refresh;
mod session;
mod transport;

/// Out-of-band events for the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Credential refresh failed; the user has to sign in again
    SessionExpired,
    Status(String),
}
