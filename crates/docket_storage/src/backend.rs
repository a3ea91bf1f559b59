//! Storage backend trait definition.

use crate::batch::WriteBatch;
use crate::error::StorageResult;

/// A key/value storage backend for Docket.
///
/// # Invariants
///
/// - `commit` applies every operation of the batch or none of them
/// - After `commit` returns, `get` and `scan_prefix` observe the batch
/// - `scan_prefix` returns entries in ascending key order
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryBackend`] - For testing
/// - [`super::LogBackend`] - For persistent storage
pub trait KvBackend: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Returns every entry whose key starts with `prefix`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable. In that
    /// case none of its operations are visible.
    fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Flushes buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Returns the number of keys currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn key_count(&self) -> StorageResult<usize>;
}
