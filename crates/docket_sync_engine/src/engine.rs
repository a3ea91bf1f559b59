//! The engine facade.
//!
//! One [`Engine`] per running application. It owns the initialization
//! gate, the backend and the active tenant session, and wires the sync
//! queue, worker, reconciler and realtime bridge of that session
//! together.
//!
//! Lifecycle:
//! - [`Engine::open`] runs `Unopened -> Opening -> Ready | Failed`:
//!   attach storage, run migrations, load the tenant's store, rebuild its
//!   queue from the dirty set, then optionally start sync.
//! - [`Engine::switch_tenant`] and [`Engine::end_session`] tear down the
//!   session's subscriptions and stop its worker; queued items persist.
//! - [`Engine::emergency_reset`] clears every key the engine owns and
//!   restarts through the configured [`RestartHook`].

use crate::bridge::RealtimeBridge;
use crate::config::{EngineConfig, StorageLocation};
use crate::error::{SyncError, SyncResult};
use crate::notice::{Notifier, SyncNotice};
use crate::queue::{DeadLetter, QueueItem, SyncQueue};
use crate::reconcile::{PassReport, Reconciler};
use crate::remote::RemoteBackend;
use crate::worker::{drain_once, DrainReport, SyncWorker, WorkerContext};
use async_trait::async_trait;
use docket_core::migration::MigrationManager;
use docket_core::recovery::wipe_all;
use docket_core::{
    now_millis, BackupManager, BackupMetadata, ChangeEvent, ChangeFeed, CoreError, DeviceMeta,
    EntityKey, EntityRecord, InitGate, Keyspace, LocalStore, Readiness, Table, TenantId, VersionRecord,
};
use docket_storage::{KvBackend, LogBackend, MemoryBackend};
use docket_sync_protocol::{Decision, OpType, RemoteEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// A cache outside the engine that emergency recovery must clear too.
pub trait CompanionCache: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Drops everything the cache holds.
    ///
    /// # Errors
    ///
    /// Any failure aborts the recovery before storage is touched.
    fn clear(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// What happens after emergency recovery cleared the engine's state.
#[async_trait]
pub trait RestartHook: Send + Sync {
    /// Brings the application back up.
    ///
    /// # Errors
    ///
    /// Any failure is reported as `RestartFailed`.
    async fn restart(&self, engine: &Engine) -> SyncResult<()>;
}

/// Reopens the engine in place, as a fresh process would.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReopenInPlace;

#[async_trait]
impl RestartHook for ReopenInPlace {
    async fn restart(&self, engine: &Engine) -> SyncResult<()> {
        engine.open().await
    }
}

/// Exits the process so a supervisor starts it again.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    /// Exit status.
    pub code: i32,
}

#[async_trait]
impl RestartHook for ExitProcess {
    async fn restart(&self, _engine: &Engine) -> SyncResult<()> {
        warn!(code = self.code, "exiting for restart after emergency reset");
        std::process::exit(self.code)
    }
}

struct Session {
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    reconciler: Arc<Reconciler>,
    wake: Arc<Notify>,
}

impl Session {
    fn tenant(&self) -> &TenantId {
        self.store.tenant()
    }
}

#[derive(Default)]
struct SyncTasks {
    worker: Option<SyncWorker>,
    bridge: Option<RealtimeBridge>,
}

/// The local-first persistence and sync engine.
pub struct Engine {
    config: EngineConfig,
    remote: Arc<dyn RemoteBackend>,
    gate: Arc<InitGate>,
    feed: Arc<ChangeFeed>,
    notifier: Notifier,
    migrations: MigrationManager,
    restart: Arc<dyn RestartHook>,
    caches: RwLock<Vec<Arc<dyn CompanionCache>>>,
    backend: RwLock<Option<Arc<dyn KvBackend>>>,
    tenant: RwLock<TenantId>,
    session: RwLock<Option<Arc<Session>>>,
    tasks: Mutex<SyncTasks>,
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("device", &self.config.device)
            .field("tenant", &*self.tenant.read())
            .field("state", &self.gate.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an unopened engine.
    pub fn new(config: EngineConfig, remote: Arc<dyn RemoteBackend>) -> Self {
        let feed = Arc::new(ChangeFeed::with_max_history(config.store.change_feed_history));
        Self {
            tenant: RwLock::new(config.tenant.clone()),
            config,
            remote,
            gate: Arc::new(InitGate::new()),
            feed,
            notifier: Notifier::default(),
            migrations: MigrationManager::with_builtin(),
            restart: Arc::new(ReopenInPlace),
            caches: RwLock::new(Vec::new()),
            backend: RwLock::new(None),
            session: RwLock::new(None),
            tasks: Mutex::new(SyncTasks::default()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Replaces the schema migrations run while opening.
    #[must_use]
    pub fn with_migrations(mut self, migrations: MigrationManager) -> Self {
        self.migrations = migrations;
        self
    }

    /// Replaces what happens after emergency recovery.
    #[must_use]
    pub fn with_restart_hook(mut self, hook: Arc<dyn RestartHook>) -> Self {
        self.restart = hook;
        self
    }

    /// Registers a cache that emergency recovery clears.
    pub fn register_cache(&self, cache: Arc<dyn CompanionCache>) {
        self.caches.write().push(cache);
    }

    // === Lifecycle ===

    /// Opens the engine. Consumers that did not call this themselves
    /// should use [`Engine::wait_until_ready`].
    ///
    /// A failed open may be retried; the gate goes back through
    /// `Opening`.
    ///
    /// # Errors
    ///
    /// `StorageCorruption` if the store cannot be read, `MigrationFailed`,
    /// `InvalidOperation` if already open, storage errors.
    pub async fn open(&self) -> SyncResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.open_locked().await
    }

    async fn open_locked(&self) -> SyncResult<()> {
        if matches!(self.gate.state(), Readiness::Failed(_)) {
            self.gate.reset();
        }
        self.gate.begin_opening()?;
        let tenant = self.tenant.read().clone();
        info!(device = %self.config.device, tenant = %tenant, storage = ?self.config.storage, "engine opening");

        match self.prepare(&tenant) {
            Ok(session) => {
                *self.session.write() = Some(Arc::new(session));
                self.gate.mark_ready()?;
                info!(tenant = %tenant, "engine ready");
                if self.config.autostart_sync {
                    self.start_sync().await?;
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, corruption = e.is_corruption(), "engine failed to open");
                self.gate.mark_failed(reason.clone())?;
                self.notifier.send(SyncNotice::InitializationFailed { reason });
                Err(e)
            }
        }
    }

    fn prepare(&self, tenant: &TenantId) -> SyncResult<Session> {
        let backend = self.attach_backend()?;
        let keyspace = Keyspace::new(&self.config.device);
        let run = self
            .migrations
            .run_pending(backend.as_ref(), &keyspace, &self.config.store)?;
        if !run.applied.is_empty() {
            info!(applied = run.applied.len(), version = run.final_version, "migrations applied");
        }
        DeviceMeta::new(backend.as_ref(), &keyspace).record_config(&self.config.store, now_millis())?;
        self.load_session(&backend, &keyspace, tenant)
    }

    fn attach_backend(&self) -> SyncResult<Arc<dyn KvBackend>> {
        if let Some(backend) = self.backend.read().clone() {
            return Ok(backend);
        }
        let backend: Arc<dyn KvBackend> = match &self.config.storage {
            StorageLocation::Memory => Arc::new(MemoryBackend::new()),
            StorageLocation::Directory(path) => {
                let log = LogBackend::open(path, self.config.log.clone()).map_err(|e| {
                    if e.is_corruption() {
                        CoreError::corruption(e.to_string())
                    } else {
                        CoreError::Storage(e)
                    }
                })?;
                Arc::new(log)
            }
            StorageLocation::Custom(backend) => Arc::clone(backend),
        };
        *self.backend.write() = Some(Arc::clone(&backend));
        Ok(backend)
    }

    fn load_session(&self, backend: &Arc<dyn KvBackend>, keyspace: &Keyspace, tenant: &TenantId) -> SyncResult<Session> {
        let keys = keyspace.tenant(tenant);
        let (store, report) = LocalStore::load(
            Arc::clone(backend),
            keys.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.feed),
            self.config.store.clone(),
        )?;
        let store = Arc::new(store);
        let queue = Arc::new(SyncQueue::open(Arc::clone(backend), keys)?);
        let rebuilt = queue.rebuild(&report.dirty)?;
        info!(
            tenant = %tenant,
            entities = report.entities,
            dirty = report.dirty.len(),
            requeued = rebuilt.enqueued,
            parked = rebuilt.parked,
            "tenant session loaded"
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            self.config.conflict_policy,
            self.notifier.clone(),
        ));
        Ok(Session {
            store,
            queue,
            reconciler,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Returns the readiness state.
    pub fn readiness(&self) -> Readiness {
        self.gate.state()
    }

    /// Waits until the engine is ready.
    ///
    /// Safe to call from any number of consumers; all see the same
    /// outcome.
    ///
    /// # Errors
    ///
    /// `InitializationFailed` with the failure reason.
    pub async fn wait_until_ready(&self) -> SyncResult<()> {
        Ok(self.gate.wait_until_ready().await?)
    }

    /// Returns the tenant of the active session, or the tenant the next
    /// open will load.
    pub fn tenant(&self) -> TenantId {
        self.tenant.read().clone()
    }

    /// Replaces the active session with one for `tenant`.
    ///
    /// The old session's subscriptions end and its worker stops; its
    /// queued items stay persisted for its next session.
    ///
    /// # Errors
    ///
    /// `NotReady` before open, or the errors of loading the new session.
    /// The old session stays active if loading fails.
    pub async fn switch_tenant(&self, tenant: TenantId) -> SyncResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.gate.ensure_ready()?;
        let backend = self.backend.read().clone().ok_or(SyncError::NoActiveSession)?;
        let keyspace = Keyspace::new(&self.config.device);
        let session = self.load_session(&backend, &keyspace, &tenant)?;

        self.stop_sync().await;
        let previous = self.session.write().replace(Arc::new(session));
        *self.tenant.write() = tenant.clone();
        info!(
            from = ?previous.as_ref().map(|s| s.tenant().clone()),
            to = %tenant,
            "tenant switched"
        );
        if self.config.autostart_sync {
            self.start_sync().await?;
        }
        Ok(())
    }

    /// Ends the active session (logout). Queued items persist.
    pub async fn end_session(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_sync().await;
        if let Some(session) = self.session.write().take() {
            info!(tenant = %session.tenant(), "session ended");
        }
    }

    // === Sync control ===

    /// Starts the queue worker and realtime bridge of the active session.
    /// Does nothing for parts already running.
    ///
    /// # Errors
    ///
    /// `NotReady` or `NoActiveSession`.
    pub async fn start_sync(&self) -> SyncResult<()> {
        let session = self.session()?;
        let mut tasks = self.tasks.lock().await;
        if tasks.worker.is_none() {
            tasks.worker = Some(SyncWorker::spawn(
                self.worker_context(&session),
                Arc::clone(&session.wake),
            ));
        }
        if tasks.bridge.is_none() {
            tasks.bridge = Some(RealtimeBridge::start(
                session.tenant().clone(),
                Arc::clone(&self.remote),
                Arc::clone(&session.reconciler),
                self.config.bridge.clone(),
                self.notifier.clone(),
            ));
        }
        Ok(())
    }

    /// Stops the worker and bridge. Pending items stay queued.
    pub async fn stop_sync(&self) {
        let (worker, bridge) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.worker.take(), tasks.bridge.take())
        };
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }

    /// Returns true if the worker or bridge is running.
    pub async fn is_syncing(&self) -> bool {
        let tasks = self.tasks.lock().await;
        tasks.worker.is_some() || tasks.bridge.is_some()
    }

    /// Pushes everything due now and waits for the outcomes.
    ///
    /// # Errors
    ///
    /// `NotReady` or `NoActiveSession`.
    pub async fn drain_once(&self) -> SyncResult<DrainReport> {
        let session = self.session()?;
        Ok(drain_once(&self.worker_context(&session)).await)
    }

    /// Runs a reconciliation pass over the remote's snapshot of `table`.
    ///
    /// # Errors
    ///
    /// Remote errors, `NotReady` or `NoActiveSession`.
    pub async fn reconcile_table(&self, table: Table) -> SyncResult<PassReport> {
        let session = self.session()?;
        let rows = self
            .remote
            .snapshot(session.tenant().as_str(), table.as_str())
            .await?;
        session.reconciler.reconcile_rows(table, rows)
    }

    /// Reconciles one remote event delivered outside the bridge.
    ///
    /// # Errors
    ///
    /// The errors of [`Reconciler::reconcile`].
    pub fn reconcile_event(&self, event: &RemoteEvent) -> SyncResult<Decision> {
        self.session()?.reconciler.reconcile(event)
    }

    fn worker_context(&self, session: &Session) -> WorkerContext {
        WorkerContext::new(
            Arc::clone(&session.store),
            Arc::clone(&session.queue),
            Arc::clone(&self.remote),
            self.config.retry.clone(),
            self.config.worker.clone(),
            self.notifier.clone(),
        )
    }

    fn session(&self) -> SyncResult<Arc<Session>> {
        self.gate.ensure_ready()?;
        self.session.read().clone().ok_or(SyncError::NoActiveSession)
    }

    // === Local data ===

    /// Writes an entity of the active tenant and queues it for push.
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`, `WriteContention`, storage errors.
    pub fn write(&self, table: Table, id: &str, payload: Value) -> SyncResult<u64> {
        let session = self.session()?;
        let version = session.store.write(session.tenant(), table, id, payload.clone())?;
        self.queue_local(&session, EntityKey::new(table, id), Some(payload), version);
        Ok(version)
    }

    /// Writes an entity if its version is still `expected`.
    ///
    /// # Errors
    ///
    /// `VersionConflict`, plus the errors of [`Engine::write`].
    pub fn write_if(&self, table: Table, id: &str, payload: Value, expected: u64) -> SyncResult<u64> {
        let session = self.session()?;
        let version = session
            .store
            .write_if(session.tenant(), table, id, payload.clone(), expected)?;
        self.queue_local(&session, EntityKey::new(table, id), Some(payload), version);
        Ok(version)
    }

    /// Deletes an entity (leaving a tombstone until the remote
    /// acknowledges it) and queues the delete.
    ///
    /// # Errors
    ///
    /// `EntityNotFound`, plus the errors of [`Engine::write`].
    pub fn delete(&self, table: Table, id: &str) -> SyncResult<u64> {
        let session = self.session()?;
        let version = session.store.delete(session.tenant(), table, id)?;
        self.queue_local(&session, EntityKey::new(table, id), None, version);
        Ok(version)
    }

    // The store write is already durable. If queueing fails the entity
    // is still dirty and the next open re-queues it.
    fn queue_local(&self, session: &Session, key: EntityKey, payload: Option<Value>, version: u64) {
        let tenant = session.tenant();
        let (op_type, updated_at) = match (session.store.version_record(tenant, &key), session.store.record(tenant, &key)) {
            (Ok(versions), Ok(record)) => {
                let op_type = match (&payload, versions) {
                    (None, _) => OpType::Delete,
                    (Some(_), Some(v)) if v.synced_version > 0 => OpType::Update,
                    (Some(_), _) => OpType::Create,
                };
                let updated_at = record
                    .filter(|r| r.version == version)
                    .map_or_else(now_millis, |r| r.updated_at);
                (op_type, updated_at)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(tenant = %tenant, entity = %key, error = %e, "could not inspect entity for queueing");
                return;
            }
        };

        match session.queue.enqueue(key.clone(), op_type, payload, version, updated_at) {
            Ok(op_id) => {
                debug!(tenant = %tenant, entity = %key, op_id, version, "local change queued");
                session.wake.notify_one();
            }
            Err(e) => {
                error!(tenant = %tenant, entity = %key, version, error = %e, "local change not queued; it is re-queued on next open");
            }
        }
    }

    /// Reads a live entity of the active tenant.
    ///
    /// # Errors
    ///
    /// `EntityNotFound`, `NotReady`, `NoActiveSession`.
    pub fn read(&self, table: Table, id: &str) -> SyncResult<EntityRecord> {
        let session = self.session()?;
        Ok(session.store.read(session.tenant(), table, id)?)
    }

    /// Lists the live entities of one table.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn scan(&self, table: Table) -> SyncResult<Vec<EntityRecord>> {
        let session = self.session()?;
        Ok(session.store.scan(session.tenant(), table)?)
    }

    /// Returns the version record of an entity.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn version_record(&self, table: Table, id: &str) -> SyncResult<Option<VersionRecord>> {
        let session = self.session()?;
        Ok(session
            .store
            .version_record(session.tenant(), &EntityKey::new(table, id))?)
    }

    /// Returns true if an entity has unacknowledged changes.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn is_dirty(&self, table: Table, id: &str) -> SyncResult<bool> {
        let session = self.session()?;
        Ok(session.store.is_dirty(session.tenant(), &EntityKey::new(table, id))?)
    }

    /// Lists dirty entities, optionally of one table.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn list_dirty(&self, table: Option<Table>) -> SyncResult<Vec<EntityKey>> {
        let session = self.session()?;
        Ok(session.store.list_dirty(session.tenant(), table)?)
    }

    /// Subscribes to local change events (writes, deletes and installed
    /// remote changes).
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Returns the change feed, for consumers that poll by sequence.
    pub fn change_feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Subscribes to user-visible sync notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notifier.subscribe()
    }

    // === Queue ===

    /// Returns the queued pushes of the active tenant.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn pending(&self) -> SyncResult<Vec<QueueItem>> {
        Ok(self.session()?.queue.items())
    }

    /// Returns the dead letters of the active tenant.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self.session()?.queue.dead_letters())
    }

    /// Queues a dead letter again with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// `UnknownOperation`, `NotReady`, `NoActiveSession`, storage errors.
    pub fn requeue_dead_letter(&self, op_id: u64) -> SyncResult<u64> {
        let session = self.session()?;
        let new_id = session.queue.requeue_dead_letter(op_id)?;
        session.wake.notify_one();
        Ok(new_id)
    }

    /// Deletes a dead letter. The entity stays dirty and parked.
    ///
    /// # Errors
    ///
    /// `UnknownOperation`, `NotReady`, `NoActiveSession`, storage errors.
    pub fn discard_dead_letter(&self, op_id: u64) -> SyncResult<DeadLetter> {
        self.session()?.queue.discard_dead_letter(op_id)
    }

    // === Snapshots ===

    /// Stores an emergency backup of the active tenant under its backup key.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`, storage errors.
    pub fn save_emergency_backup(&self) -> SyncResult<BackupMetadata> {
        let session = self.session()?;
        let store = &session.store;
        Ok(BackupManager::with_defaults().save_emergency_backup(store.backend().as_ref(), store.keys())?)
    }

    /// Stores the application's opaque snapshot blob.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`, storage errors.
    pub fn save_app_snapshot(&self, snapshot: Vec<u8>) -> SyncResult<()> {
        let session = self.session()?;
        let keyspace = Keyspace::new(&self.config.device);
        Ok(DeviceMeta::new(session.store.backend().as_ref(), &keyspace).save_app_snapshot(snapshot)?)
    }

    /// Returns the application's snapshot blob.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`, storage errors.
    pub fn app_snapshot(&self) -> SyncResult<Option<Vec<u8>>> {
        let session = self.session()?;
        let keyspace = Keyspace::new(&self.config.device);
        Ok(DeviceMeta::new(session.store.backend().as_ref(), &keyspace).app_snapshot()?)
    }

    /// Returns when the active tenant's data was last committed.
    ///
    /// # Errors
    ///
    /// `NotReady`, `NoActiveSession`, storage errors.
    pub fn last_saved(&self) -> SyncResult<Option<u64>> {
        Ok(self.session()?.store.last_saved()?)
    }

    // === Emergency recovery ===

    /// Clears every key the engine owns and every registered cache, then
    /// restarts through the [`RestartHook`].
    ///
    /// From the moment this is called every read and write fails with
    /// `NotReady` until the restart completes. If anything cannot be
    /// cleared nothing restarts: storage is left as it was and reopened.
    ///
    /// # Errors
    ///
    /// `RecoveryFailed` if clearing failed, `RestartFailed` if the state
    /// was cleared but the restart failed.
    pub async fn emergency_reset(&self) -> SyncResult<()> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            warn!(device = %self.config.device, "emergency reset requested");
            self.stop_sync().await;
            self.gate.reset();
            self.session.write().take();

            if let Err(e) = self.clear_everything() {
                error!(error = %e, "emergency reset failed, reopening existing state");
                if let Err(reopen) = self.open_locked().await {
                    error!(error = %reopen, "reopen after failed reset also failed");
                }
                return Err(e);
            }
            info!("engine state cleared, restarting");
        }

        self.restart
            .restart(self)
            .await
            .map_err(|e| SyncError::RestartFailed { message: e.to_string() })
    }

    fn clear_everything(&self) -> SyncResult<()> {
        for cache in self.caches.read().iter() {
            cache.clear().map_err(|e| {
                SyncError::recovery_failed(format!("cache {} could not be cleared: {e}", cache.name()))
            })?;
            debug!(cache = cache.name(), "companion cache cleared");
        }

        let backend = self.backend.read().clone();
        match (backend, &self.config.storage) {
            (Some(backend), _) => {
                let report = wipe_all(backend.as_ref()).map_err(|e| SyncError::recovery_failed(e.to_string()))?;
                info!(keys_removed = report.keys_removed, "storage wiped");
            }
            // The backend never opened; the log is discarded unread.
            (None, StorageLocation::Directory(path)) => {
                LogBackend::destroy(path).map_err(|e| SyncError::recovery_failed(e.to_string()))?;
            }
            (None, StorageLocation::Custom(backend)) => {
                wipe_all(backend.as_ref()).map_err(|e| SyncError::recovery_failed(e.to_string()))?;
            }
            (None, StorageLocation::Memory) => {}
        }

        // Release the backend, and with it any directory lock, so the
        // restart attaches afresh.
        self.backend.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use docket_core::DeviceId;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> EngineConfig {
        EngineConfig::new(DeviceId::new("laptop"), TenantId::new("acme")).autostart_sync(false)
    }

    fn engine() -> Engine {
        Engine::new(config(), Arc::new(MockRemote::new()))
    }

    #[tokio::test]
    async fn operations_fail_fast_before_open() {
        let engine = engine();
        assert!(matches!(engine.read(Table::Cases, "c"), Err(SyncError::Core(CoreError::NotReady))));
        assert!(matches!(
            engine.write(Table::Cases, "c", json!({})),
            Err(SyncError::Core(CoreError::NotReady))
        ));
        engine.open().await.unwrap();
        engine.wait_until_ready().await.unwrap();
        assert_eq!(engine.readiness(), Readiness::Ready);
    }

    #[tokio::test]
    async fn writes_are_queued_with_the_right_operation() {
        let engine = engine();
        engine.open().await.unwrap();

        engine.write(Table::Cases, "case-1", json!({"number": "1"})).unwrap();
        engine.write(Table::Cases, "case-1", json!({"number": "2"})).unwrap();
        let pending = engine.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op_type, OpType::Create);
        assert_eq!(pending[0].payload, Some(json!({"number": "2"})));

        engine.drain_once().await.unwrap();
        engine.delete(Table::Cases, "case-1").unwrap();
        assert_eq!(engine.pending().unwrap()[0].op_type, OpType::Delete);
    }

    #[tokio::test]
    async fn open_twice_is_refused() {
        let engine = engine();
        engine.open().await.unwrap();
        assert!(matches!(engine.open().await, Err(SyncError::Core(CoreError::InvalidOperation { .. }))));
    }

    struct FailingCache;

    impl CompanionCache for FailingCache {
        fn name(&self) -> &str {
            "query-cache"
        }

        fn clear(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("disk full".into())
        }
    }

    #[tokio::test]
    async fn failed_reset_keeps_state_and_does_not_restart() {
        struct Flag(AtomicBool);
        #[async_trait]
        impl RestartHook for Flag {
            async fn restart(&self, _engine: &Engine) -> SyncResult<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let engine = engine().with_restart_hook(flag.clone());
        engine.open().await.unwrap();
        engine.write(Table::Notes, "n-1", json!("keep me")).unwrap();
        engine.register_cache(Arc::new(FailingCache));

        let err = engine.emergency_reset().await.unwrap_err();

        assert!(matches!(err, SyncError::RecoveryFailed { .. }));
        assert!(err.to_string().contains("query-cache"));
        assert!(!flag.0.load(Ordering::SeqCst));
        assert_eq!(engine.read(Table::Notes, "n-1").unwrap().payload, json!("keep me"));
    }

    #[tokio::test]
    async fn ended_session_refuses_operations() {
        let engine = engine();
        engine.open().await.unwrap();
        engine.end_session().await;
        assert!(matches!(engine.read(Table::Tasks, "t"), Err(SyncError::NoActiveSession)));
    }

    #[tokio::test]
    async fn app_snapshot_round_trip() {
        let engine = engine();
        engine.open().await.unwrap();
        assert_eq!(engine.app_snapshot().unwrap(), None);
        engine.save_app_snapshot(b"ui-state".to_vec()).unwrap();
        assert_eq!(engine.app_snapshot().unwrap(), Some(b"ui-state".to_vec()));
        assert!(engine.last_saved().unwrap().is_none());
        engine.write(Table::Tasks, "t", json!({})).unwrap();
        assert!(engine.last_saved().unwrap().is_some());
    }
}
