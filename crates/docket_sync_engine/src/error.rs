//! Error types for the sync engine.

use docket_codec::CodecError;
use docket_core::CoreError;
use docket_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached or failed temporarily.
    #[error("remote unavailable: {message}")]
    RemoteTransient {
        /// Error message.
        message: String,
    },

    /// The remote refused the operation.
    #[error("remote rejected the operation: {message}")]
    RemoteRejected {
        /// Reason given by the remote.
        message: String,
    },

    /// A remote message could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Queue storage error.
    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queue encoding error.
    #[error("queue codec error: {0}")]
    Codec(#[from] CodecError),

    /// No queue item or dead letter with this operation ID.
    #[error("unknown operation {op_id}")]
    UnknownOperation {
        /// Operation ID.
        op_id: u64,
    },

    /// Emergency recovery could not clear every key; nothing was restarted.
    #[error("emergency recovery failed: {message}")]
    RecoveryFailed {
        /// What failed.
        message: String,
    },

    /// State was cleared but the engine did not come back up.
    #[error("restart after recovery failed: {message}")]
    RestartFailed {
        /// What failed.
        message: String,
    },

    /// No tenant session is active.
    #[error("no active tenant session")]
    NoActiveSession,

    /// The operation was cancelled by shutdown.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a transient remote error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::RemoteTransient {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            message: message.into(),
        }
    }

    /// Creates a recovery error.
    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RemoteTransient { .. } => true,
            SyncError::Core(CoreError::WriteContention { .. } | CoreError::VersionConflict { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if the error means the local store is damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            SyncError::Core(e) => e.is_corruption(),
            SyncError::Storage(e) => e.is_corruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transient("connection lost").is_retryable());
        assert!(!SyncError::rejected("title is required").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Core(CoreError::NotReady).is_retryable());
    }

    #[test]
    fn corruption_is_detected_through_layers() {
        assert!(SyncError::Storage(StorageError::corrupted("bad frame")).is_corruption());
        assert!(SyncError::Core(CoreError::corruption("undecodable record")).is_corruption());
        assert!(!SyncError::NoActiveSession.is_corruption());
    }

    #[test]
    fn error_display() {
        let err = SyncError::UnknownOperation { op_id: 42 };
        assert_eq!(err.to_string(), "unknown operation 42");
        assert!(SyncError::Core(CoreError::NotReady).to_string().contains("not ready"));
    }
}
