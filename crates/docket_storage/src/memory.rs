//! In-memory storage backend for testing.

use crate::backend::KvBackend;
use crate::batch::WriteBatch;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory key/value backend.
///
/// This backend keeps all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// Sharing one `MemoryBackend` behind an `Arc` across two engine
/// instances is how tests simulate a process restart.
///
/// # Example
///
/// ```rust
/// use docket_storage::{KvBackend, MemoryBackend, WriteBatch};
///
/// let backend = MemoryBackend::new();
/// let mut batch = WriteBatch::new();
/// batch.put("k", b"v".to_vec());
/// backend.commit(batch).unwrap();
/// assert_eq!(backend.key_count().unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every entry.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().clone()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        batch.apply_to(&mut self.data.write());
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }

    fn key_count(&self) -> StorageResult<usize> {
        Ok(self.data.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(backend: &MemoryBackend, key: &str, value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(key, value.to_vec());
        backend.commit(batch).unwrap();
    }

    #[test]
    fn memory_new_is_empty() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.key_count().unwrap(), 0);
        assert!(backend.snapshot().is_empty());
    }

    #[test]
    fn memory_get_missing_is_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("nope").unwrap(), None);
    }

    #[test]
    fn memory_put_and_get() {
        let backend = MemoryBackend::new();
        put(&backend, "a", b"1");
        put(&backend, "a", b"2");
        assert_eq!(backend.get("a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn memory_scan_prefix_is_ordered_and_bounded() {
        let backend = MemoryBackend::new();
        put(&backend, "t/acme/entities/cases/b", b"b");
        put(&backend, "t/acme/entities/cases/a", b"a");
        put(&backend, "t/acme/entities/tasks/z", b"z");
        put(&backend, "t/acmf/entities/cases/x", b"x");

        let scanned = backend.scan_prefix("t/acme/entities/cases/").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["t/acme/entities/cases/a", "t/acme/entities/cases/b"]
        );
    }

    #[test]
    fn memory_clear() {
        let backend = MemoryBackend::new();
        put(&backend, "a", b"1");
        backend.clear();
        assert_eq!(backend.key_count().unwrap(), 0);
    }
}
