//! Error types for Docket core.

use crate::types::{EntityKey, TenantId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Docket core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docket_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] docket_codec::CodecError),

    /// The store has not finished opening.
    #[error("store is not ready")]
    NotReady,

    /// An operation named a tenant other than the active one.
    #[error("scope violation: active tenant is {active}, operation targeted {requested}")]
    ScopeViolation {
        /// The tenant the store is scoped to.
        active: TenantId,
        /// The tenant the caller asked for.
        requested: TenantId,
    },

    /// Persisted state could not be opened, decoded or migrated.
    #[error("storage corruption: {message}")]
    StorageCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Entity not found, or only present as a tombstone.
    #[error("entity not found: {key}")]
    EntityNotFound {
        /// The entity that was looked up.
        key: EntityKey,
    },

    /// The entity changed between observing and committing a write.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The contended entity.
        key: EntityKey,
        /// The version the writer observed.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// A write kept losing version races until its retry budget ran out.
    #[error("write contention on {key} after {attempts} attempts")]
    WriteContention {
        /// The contended entity.
        key: EntityKey,
        /// Attempts made.
        attempts: u32,
    },

    /// Initialization ended in the failed state.
    #[error("initialization failed: {reason}")]
    InitializationFailed {
        /// Reason reported when opening failed.
        reason: String,
    },

    /// A schema migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// A wipe finished but keys were still present afterwards.
    #[error("wipe incomplete: {remaining} keys remain")]
    WipeIncomplete {
        /// Keys found after the wipe.
        remaining: usize,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a storage corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::StorageCorruption {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error means persisted state cannot be trusted.
    ///
    /// Initialization failures of this kind are remedied by emergency
    /// recovery.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::StorageCorruption { .. } | Self::MigrationFailed { .. } | Self::Codec(_) => true,
            Self::Storage(e) => e.is_corruption(),
            _ => false,
        }
    }
}
