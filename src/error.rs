//! Error types for the chat delivery pipeline

use thiserror::Error;

/// A send that was rejected before anything left the client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message has no text and no attachments")]
    EmptyMessage,
    #[error("Attachment {name} is {size} bytes, limit is {limit} bytes")]
    AttachmentTooLarge { name: String, size: u64, limit: u64 },
    #[error("A shared item cannot be sent together with attachments")]
    SharedItemWithAttachments,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("None of the {requested} attachments could be uploaded")]
    NothingUploaded { requested: usize },
    #[error("Storage rejected {path}: {reason}")]
    Rejected { path: String, reason: String },
    #[error("Could not read {name}: {reason}")]
    Unreadable { name: String, reason: String },
}

/// Outbound call failures, split into retryable and terminal by `is_retryable`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,
    #[error("No response from server: {0}")]
    NoResponse(String),
    #[error("Server answered {status}: {body}")]
    Status { status: u16, body: String },
}

impl NetworkError {
    pub const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Timeout | NetworkError::NoResponse(_) => true,
            NetworkError::Status { status, .. } => Self::RETRYABLE_STATUSES.contains(status),
        }
    }

    /// True when the call never produced an HTTP response at all
    pub fn is_no_response(&self) -> bool {
        matches!(self, NetworkError::Timeout | NetworkError::NoResponse(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No refresh credential available")]
    MissingRefreshToken,
    #[error("Refresh rejected with status {0}")]
    Rejected(u16),
    #[error("Refresh failed: {0}")]
    Refresh(String),
    #[error("Refresh was abandoned before completing")]
    Interrupted,
    #[error("Session already ended")]
    SignedOut,
}

/// Malformed embedded JSON in message content; never leaves the codec
#[derive(Error, Debug)]
#[error("Malformed {what} payload: {source}")]
pub struct DecodeError {
    pub what: &'static str,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("Unexpected response body: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Network(NetworkError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
