//! Test fixtures and store helpers.
//!
//! Provides ready-to-use tenant stores over memory or a temporary
//! directory, with the gate already open.

use docket_core::{
    ChangeFeed, DeviceId, InitGate, Keyspace, LoadReport, LocalStore, StoreConfig, Table, TenantId, TenantKeys,
};
use docket_storage::{KvBackend, LogBackend, LogConfig, MemoryBackend};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// The device used by fixtures.
pub fn test_device() -> DeviceId {
    DeviceId::new("test-device")
}

/// The tenant used by fixtures.
pub fn test_tenant() -> TenantId {
    TenantId::new("acme")
}

/// A second tenant, for isolation tests.
pub fn other_tenant() -> TenantId {
    TenantId::new("globex")
}

/// A ready local store with automatic cleanup.
pub struct TestStore {
    /// The store.
    pub store: Arc<LocalStore>,
    /// What loading found.
    pub report: LoadReport,
    /// The shared gate, already `Ready`.
    pub gate: Arc<InitGate>,
    /// The shared change feed.
    pub feed: Arc<ChangeFeed>,
    /// The backend under the store.
    pub backend: Arc<dyn KvBackend>,
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Opens a store for [`test_tenant`] over memory.
    pub fn memory() -> Self {
        Self::over(Arc::new(MemoryBackend::new()), &test_tenant())
    }

    /// Opens a store for [`test_tenant`] over a log in a fresh temporary
    /// directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = LogBackend::open(temp_dir.path(), LogConfig::default()).expect("Failed to open log backend");
        let mut store = Self::over(Arc::new(backend), &test_tenant());
        store.temp_dir = Some(temp_dir);
        store
    }

    /// Opens a store for `tenant` over an existing backend.
    pub fn over(backend: Arc<dyn KvBackend>, tenant: &TenantId) -> Self {
        let gate = Arc::new(InitGate::new());
        let feed = Arc::new(ChangeFeed::new());
        gate.begin_opening().expect("Fresh gate must open");
        let (store, report) = LocalStore::load(
            Arc::clone(&backend),
            tenant_keys(tenant),
            Arc::clone(&gate),
            Arc::clone(&feed),
            StoreConfig::default(),
        )
        .expect("Failed to load store");
        gate.mark_ready().expect("Gate must become ready");
        Self {
            store: Arc::new(store),
            report,
            gate,
            feed,
            backend,
            temp_dir: None,
        }
    }

    /// Reloads the store as a fresh process would. File-backed stores
    /// replay their log from disk; every other handle to the store must
    /// be dropped first.
    pub fn reopen(self) -> Self {
        let Self {
            store,
            backend,
            temp_dir,
            ..
        } = self;
        let tenant = store.tenant().clone();
        drop(store);

        let backend: Arc<dyn KvBackend> = match &temp_dir {
            Some(dir) => {
                drop(backend);
                Arc::new(LogBackend::open(dir.path(), LogConfig::default()).expect("Failed to reopen log backend"))
            }
            None => backend,
        };
        let mut reopened = Self::over(backend, &tenant);
        reopened.temp_dir = temp_dir;
        reopened
    }

    /// Returns the temporary directory of a file-backed store.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns the store's tenant.
    pub fn tenant(&self) -> &TenantId {
        self.store.tenant()
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// The key namespace of `tenant` on [`test_device`].
pub fn tenant_keys(tenant: &TenantId) -> TenantKeys {
    Keyspace::new(&test_device()).tenant(tenant)
}

/// Runs a test against a fresh in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::memory();
    f(&store)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A store holding `count` cases, each written once and never synced.
    pub fn populated_store(count: usize) -> TestStore {
        let store = TestStore::memory();
        let tenant = test_tenant();
        for i in 0..count {
            store
                .write(&tenant, Table::Cases, &format!("case-{i}"), json!({ "number": i }))
                .expect("Failed to write case");
        }
        store
    }

    /// A store where `synced` of `count` cases have been acknowledged by
    /// the remote and the rest are still dirty.
    pub fn partially_synced_store(count: usize, synced: usize) -> TestStore {
        let store = populated_store(count);
        let tenant = test_tenant();
        for i in 0..synced.min(count) {
            let key = docket_core::EntityKey::new(Table::Cases, format!("case-{i}"));
            store.mark_synced(&tenant, &key, 1).expect("Failed to mark synced");
        }
        store
    }
}
