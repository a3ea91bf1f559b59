//! Error types for the reference remote.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by the reference remote.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is refused for good.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The remote is unreachable or failed internally.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The pushed version is not newer than the stored row.
    #[error("stale push: stored version {current}, pushed {pushed}")]
    Stale {
        /// Version stored on the remote.
        current: u64,
        /// Version in the push.
        pushed: u64,
    },

    /// Subscriber limit reached.
    #[error("too many subscribers: limit {limit}")]
    TooManySubscribers {
        /// Configured limit.
        limit: usize,
    },

    /// Wire encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] docket_codec::CodecError),
}

impl ServerError {
    /// Returns true if the client may succeed by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::Unavailable(_) | ServerError::Stale { .. } | ServerError::TooManySubscribers { .. }
        )
    }

    /// Returns true if the request itself is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::Rejected(_) | ServerError::Stale { .. } | ServerError::Codec(_)
        )
    }
}
