//! Benchmark utilities.
//!
//! Shared setup for the criterion benches: ready-to-write stores over
//! memory or a temporary directory, and payloads of a given size.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use docket_core::{ChangeFeed, DeviceId, InitGate, Keyspace, LocalStore, StoreConfig, TenantId};
use docket_storage::{KvBackend, LogBackend, LogConfig, MemoryBackend};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

/// Tenant every bench store belongs to.
pub fn bench_tenant() -> TenantId {
    TenantId::new("bench")
}

/// Opens a ready store over `backend`.
pub fn open_store(backend: Arc<dyn KvBackend>) -> LocalStore {
    let gate = Arc::new(InitGate::new());
    gate.begin_opening().expect("fresh gate");
    let keys = Keyspace::new(&DeviceId::new("bench-device")).tenant(&bench_tenant());
    let (store, _) = LocalStore::load(
        backend,
        keys,
        Arc::clone(&gate),
        Arc::new(ChangeFeed::new()),
        StoreConfig::default(),
    )
    .expect("store loads");
    gate.mark_ready().expect("gate opens");
    store
}

/// A ready store held in memory.
pub fn memory_store() -> LocalStore {
    open_store(Arc::new(MemoryBackend::new()))
}

/// A ready store over a log in a fresh temporary directory.
///
/// Commits are not fsynced, so the numbers measure the store rather than
/// the disk.
pub fn log_store() -> (LocalStore, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let backend = LogBackend::open(dir.path(), LogConfig::new().sync_on_commit(false)).expect("log opens");
    (open_store(Arc::new(backend)), dir)
}

/// A record payload whose text fields add up to roughly `size` bytes.
pub fn payload(size: usize) -> Value {
    let text: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect();
    json!({ "title": "bench", "body": text, "closed": false })
}

/// Entity ids `e-0` .. `e-{count-1}`.
pub fn ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("e-{i}")).collect()
}
