//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] docket_codec::CodecError),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the storage directory lock.
    #[error("storage locked by another process: {}", path.display())]
    Locked {
        /// The locked directory.
        path: PathBuf,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if this error means the stored bytes cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted(_) | Self::Codec(_))
    }
}
