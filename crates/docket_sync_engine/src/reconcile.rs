//! Applies remote events to the local store.
//!
//! [`decide`] picks the outcome; this module carries it out through the
//! store, so every resolved event publishes exactly one change event, and
//! keeps the queue consistent with what was installed:
//!
//! | decision | store | queue |
//! |---|---|---|
//! | own push echoed before its ack | synced version advanced | older items dropped |
//! | accept | remote payload at the remote version, synced | older items dropped |
//! | conflict, remote wins, remote ahead | as accept | as accept |
//! | conflict, remote wins, remote behind | remote payload above the local version | pushed so the remote converges |
//! | conflict, local wins, remote behind | untouched | untouched |
//! | conflict, local wins, remote caught up | local payload rebased above the remote | re-pushed at the rebased version |

use crate::error::{SyncError, SyncResult};
use crate::notice::{Notifier, SyncNotice};
use crate::queue::SyncQueue;
use docket_core::{now_millis, CoreError, EntityKey, EntityRecord, LocalStore, RemoteApply, Table, TenantId};
use docket_sync_protocol::{
    decide, ConflictPolicy, Decision, LocalState, OpType, RemoteEvent, RemoteRow, Winner,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_ROUNDS: u32 = 8;

/// Counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Rows compared.
    pub examined: usize,
    /// Rows installed locally.
    pub accepted: usize,
    /// Rows already reflected locally.
    pub kept: usize,
    /// Rows that conflicted with local changes.
    pub conflicts: usize,
    /// Acknowledged local entities the remote does not list.
    pub missing_remotely: usize,
}

/// Reconciles remote events for one tenant session.
pub struct Reconciler {
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    policy: ConflictPolicy,
    notifier: Notifier,
}

impl Reconciler {
    /// Creates a reconciler over a session's store and queue.
    pub fn new(store: Arc<LocalStore>, queue: Arc<SyncQueue>, policy: ConflictPolicy, notifier: Notifier) -> Self {
        Self {
            store,
            queue,
            policy,
            notifier,
        }
    }

    /// Reconciles one remote event and returns the decision taken.
    ///
    /// # Errors
    ///
    /// `ScopeViolation` for an event of another tenant, `Protocol` for an
    /// unknown table, and store or queue errors.
    pub fn reconcile(&self, event: &RemoteEvent) -> SyncResult<Decision> {
        let tenant = TenantId::new(event.tenant_id.as_str());
        let table: Table = event
            .table
            .parse()
            .map_err(|e: String| SyncError::Protocol(e))?;
        let key = EntityKey::new(table, event.entity_id.as_str());

        for round in 1..=MAX_ROUNDS {
            match self.try_reconcile(&tenant, &key, event) {
                Err(SyncError::Core(CoreError::VersionConflict { expected, actual, .. })) => {
                    debug!(entity = %key, round, expected, actual, "entity moved during reconciliation, retrying");
                }
                other => return other,
            }
        }
        Err(SyncError::Core(CoreError::WriteContention {
            key,
            attempts: MAX_ROUNDS,
        }))
    }

    /// Reconciles a table snapshot taken after (re)subscribing.
    ///
    /// Rows that fail to reconcile are logged and skipped.
    ///
    /// # Errors
    ///
    /// Store errors while listing local versions.
    pub fn reconcile_rows(&self, table: Table, rows: Vec<RemoteRow>) -> SyncResult<PassReport> {
        let tenant = self.store.tenant().clone();
        let mut report = PassReport::default();
        let mut listed = HashSet::new();

        for row in rows {
            listed.insert(row.id.clone());
            report.examined += 1;
            let event = RemoteEvent::from_row(row);
            match self.reconcile(&event) {
                Ok(Decision::AcceptRemote) => report.accepted += 1,
                Ok(Decision::KeepLocal) => report.kept += 1,
                Ok(Decision::Conflict(_)) => report.conflicts += 1,
                Err(e) => warn!(tenant = %tenant, table = %table, entity = %event.entity_id, error = %e, "row not reconciled"),
            }
        }

        for (key, versions) in self.store.known_versions(&tenant, table)? {
            if versions.synced_version > 0 && !listed.contains(&key.id) {
                report.missing_remotely += 1;
                debug!(entity = %key, synced = versions.synced_version, "acknowledged entity absent from remote snapshot");
            }
        }

        info!(
            tenant = %tenant,
            table = %table,
            examined = report.examined,
            accepted = report.accepted,
            conflicts = report.conflicts,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    fn try_reconcile(&self, tenant: &TenantId, key: &EntityKey, event: &RemoteEvent) -> SyncResult<Decision> {
        let versions = self.store.version_record(tenant, key)?;
        let record = self.store.record(tenant, key)?;
        let local = versions.map(|v| LocalState {
            local_version: v.local_version,
            synced_version: v.synced_version,
            updated_at: record.as_ref().map_or(0, |r| r.updated_at),
        });
        let remote_version = event.remote_version;

        if let Some(state) = local {
            let unacknowledged = remote_version > state.synced_version && remote_version <= state.local_version;
            if unacknowledged && self.is_echo(key, record.as_ref(), event) {
                // The remote is reporting a push of ours before its ack.
                self.store.mark_synced(tenant, key, remote_version)?;
                self.queue.drop_superseded(key, remote_version)?;
                debug!(entity = %key, remote_version, "own change confirmed by the remote");
                return Ok(Decision::KeepLocal);
            }
        }

        let decision = decide(local, event, self.policy);
        let local = local.unwrap_or_default();

        match decision {
            Decision::KeepLocal => {
                debug!(entity = %key, remote_version, local = local.local_version, "remote event already reflected");
            }
            Decision::AcceptRemote => self.accept(tenant, key, event, local)?,
            Decision::Conflict(Winner::Remote) if remote_version > local.local_version => {
                self.accept(tenant, key, event, local)?;
                self.report_conflict(tenant, key, Winner::Remote);
            }
            Decision::Conflict(Winner::Remote) => {
                // The remote payload wins but the local version is already
                // past it: install it above the local version and push it,
                // so the remote ends at the same version.
                let version = local.local_version + 1;
                self.store.apply_remote(
                    tenant,
                    RemoteApply {
                        key: key.clone(),
                        payload: event.remote_payload.clone(),
                        version,
                        synced_version: remote_version,
                        updated_at: event.updated_at,
                        expected_local: local.local_version,
                    },
                )?;
                let op_type = if event.is_delete() { OpType::Delete } else { OpType::Update };
                self.queue
                    .enqueue(key.clone(), op_type, event.remote_payload.clone(), version, event.updated_at)?;
                self.report_conflict(tenant, key, Winner::Remote);
            }
            Decision::Conflict(Winner::Local) if remote_version < local.local_version => {
                // The pending push already carries a higher version.
                self.report_conflict(tenant, key, Winner::Local);
            }
            Decision::Conflict(Winner::Local) => {
                // The remote caught up with the local version number; move
                // the local payload above it so the push is not stale.
                let (payload, op_type, updated_at) = match &record {
                    Some(r) if r.is_live() => (Some(r.payload.clone()), OpType::Update, r.updated_at),
                    Some(r) => (None, OpType::Delete, r.updated_at),
                    None => (None, OpType::Delete, now_millis()),
                };
                let version = remote_version + 1;
                self.store.apply_remote(
                    tenant,
                    RemoteApply {
                        key: key.clone(),
                        payload: payload.clone(),
                        version,
                        synced_version: remote_version,
                        updated_at,
                        expected_local: local.local_version,
                    },
                )?;
                self.queue.enqueue(key.clone(), op_type, payload, version, updated_at)?;
                self.report_conflict(tenant, key, Winner::Local);
            }
        }
        Ok(decision)
    }

    fn accept(&self, tenant: &TenantId, key: &EntityKey, event: &RemoteEvent, local: LocalState) -> SyncResult<()> {
        let version = event.remote_version;
        self.store.apply_remote(
            tenant,
            RemoteApply {
                key: key.clone(),
                payload: event.remote_payload.clone(),
                version,
                synced_version: version,
                updated_at: event.updated_at,
                expected_local: local.local_version,
            },
        )?;
        self.queue.drop_superseded(key, version)?;
        debug!(entity = %key, version, "accepted remote change");
        Ok(())
    }

    /// True if the event carries exactly a version this device wrote:
    /// the current record, or a queued push of an earlier version.
    fn is_echo(&self, key: &EntityKey, record: Option<&EntityRecord>, event: &RemoteEvent) -> bool {
        let same = |version: u64, payload: Option<&Value>| {
            version == event.remote_version && payload == event.remote_payload.as_ref()
        };
        let current = record.is_some_and(|r| same(r.version, r.is_live().then_some(&r.payload)));
        current
            || self
                .queue
                .items_for(key)
                .iter()
                .any(|item| same(item.version, item.payload.as_ref()))
    }

    fn report_conflict(&self, tenant: &TenantId, key: &EntityKey, winner: Winner) {
        info!(tenant = %tenant, entity = %key, ?winner, "conflict resolved");
        self.notifier.send(SyncNotice::ConflictResolved {
            tenant: tenant.clone(),
            key: key.clone(),
            winner,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{ChangeFeed, DeviceId, InitGate, Keyspace, StoreConfig};
    use docket_storage::{KvBackend, MemoryBackend};
    use docket_sync_protocol::ChangeKind;
    use serde_json::json;

    struct Fixture {
        store: Arc<LocalStore>,
        queue: Arc<SyncQueue>,
        reconciler: Reconciler,
        feed: Arc<ChangeFeed>,
        notices: tokio::sync::broadcast::Receiver<SyncNotice>,
    }

    fn fixture(policy: ConflictPolicy) -> Fixture {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let keys = Keyspace::new(&DeviceId::new("laptop")).tenant(&acme());
        let gate = Arc::new(InitGate::new());
        gate.begin_opening().unwrap();
        let feed = Arc::new(ChangeFeed::new());
        let (store, _) = LocalStore::load(
            Arc::clone(&backend),
            keys.clone(),
            Arc::clone(&gate),
            Arc::clone(&feed),
            StoreConfig::default(),
        )
        .unwrap();
        gate.mark_ready().unwrap();
        let store = Arc::new(store);
        let queue = Arc::new(SyncQueue::open(backend, keys).unwrap());
        let notifier = Notifier::default();
        let notices = notifier.subscribe();
        Fixture {
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&queue), policy, notifier),
            store,
            queue,
            feed,
            notices,
        }
    }

    fn acme() -> TenantId {
        TenantId::new("acme")
    }

    fn task() -> EntityKey {
        EntityKey::new(Table::Tasks, "task-1")
    }

    fn event(version: u64, updated_at: u64, payload: Option<Value>) -> RemoteEvent {
        RemoteEvent {
            entity_id: "task-1".into(),
            table: "tasks".into(),
            tenant_id: "acme".into(),
            kind: if payload.is_some() { ChangeKind::Update } else { ChangeKind::Delete },
            remote_version: version,
            remote_payload: payload,
            updated_at,
        }
    }

    /// Writes `task-1` `local` times and acknowledges version `synced`.
    fn seed(f: &Fixture, local: u64, synced: u64) {
        for n in 1..=local {
            let version = f.store.write(&acme(), Table::Tasks, "task-1", json!({ "local": n })).unwrap();
            f.queue
                .enqueue(task(), OpType::Update, Some(json!({ "local": n })), version, n)
                .unwrap();
        }
        if synced > 0 {
            f.store.mark_synced(&acme(), &task(), synced).unwrap();
            f.queue.drop_superseded(&task(), synced).unwrap();
        }
    }

    #[test]
    fn clean_entity_accepts_newer_remote() {
        let f = fixture(ConflictPolicy::default());
        seed(&f, 3, 3);
        let events = f.feed.subscribe();

        let decision = f.reconciler.reconcile(&event(4, 1, Some(json!("remote")))).unwrap();

        assert_eq!(decision, Decision::AcceptRemote);
        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload, json!("remote"));
        assert_eq!(record.version, 4);
        let versions = f.store.version_record(&acme(), &task()).unwrap().unwrap();
        assert_eq!(versions.synced_version, 4);
        assert!(!versions.is_dirty());
        assert_eq!(events.try_iter().count(), 1);
    }

    #[test]
    fn later_local_write_keeps_local() {
        let f = fixture(ConflictPolicy::default());
        seed(&f, 5, 3);

        let decision = f.reconciler.reconcile(&event(4, 0, Some(json!("remote")))).unwrap();

        assert_eq!(decision, Decision::Conflict(Winner::Local));
        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.version, 5);
        assert_eq!(record.payload, json!({"local": 5}));
        let items = f.queue.items_for(&task());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version, 5);
    }

    #[test]
    fn later_remote_write_wins_ahead_of_local() {
        let mut f = fixture(ConflictPolicy::default());
        seed(&f, 4, 3);

        let decision = f
            .reconciler
            .reconcile(&event(6, u64::MAX, Some(json!("remote"))))
            .unwrap();

        assert_eq!(decision, Decision::Conflict(Winner::Remote));
        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.version, 6);
        assert!(!f.store.is_dirty(&acme(), &task()).unwrap());
        assert!(f.queue.is_empty());
        assert!(matches!(
            f.notices.try_recv().unwrap(),
            SyncNotice::ConflictResolved { winner: Winner::Remote, .. }
        ));
    }

    #[test]
    fn remote_winner_behind_local_is_pushed_back() {
        let f = fixture(ConflictPolicy::ServerWins);
        seed(&f, 5, 3);

        f.reconciler.reconcile(&event(4, 0, Some(json!("remote")))).unwrap();

        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload, json!("remote"));
        assert_eq!(record.version, 6);
        let versions = f.store.version_record(&acme(), &task()).unwrap().unwrap();
        assert_eq!(versions.synced_version, 4);
        let items = f.queue.items_for(&task());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version, 6);
        assert_eq!(items[0].payload, Some(json!("remote")));
    }

    #[test]
    fn local_winner_is_rebased_above_remote() {
        let f = fixture(ConflictPolicy::ClientWins);
        seed(&f, 4, 3);

        f.reconciler.reconcile(&event(4, 0, Some(json!("remote")))).unwrap();

        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload, json!({"local": 4}));
        assert_eq!(record.version, 5);
        let items = f.queue.items_for(&task());
        assert_eq!(items.last().unwrap().version, 5);
    }

    #[test]
    fn own_push_reported_before_ack_is_an_acknowledgement() {
        let mut f = fixture(ConflictPolicy::ServerWins);
        seed(&f, 2, 0);
        let pushed = f.queue.take_ready(u64::MAX, 10);
        assert_eq!(pushed[0].version, 2);
        f.store.write(&acme(), Table::Tasks, "task-1", json!({ "local": 3 })).unwrap();

        let decision = f.reconciler.reconcile(&event(2, 2, Some(json!({ "local": 2 })))).unwrap();

        assert_eq!(decision, Decision::KeepLocal);
        let record = f.store.read(&acme(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload, json!({ "local": 3 }));
        let versions = f.store.version_record(&acme(), &task()).unwrap().unwrap();
        assert_eq!(versions.synced_version, 2);
        assert!(f.notices.try_recv().is_err());
    }

    #[test]
    fn stale_and_unknown_deletes_are_dropped() {
        let f = fixture(ConflictPolicy::default());
        seed(&f, 3, 3);
        assert_eq!(
            f.reconciler.reconcile(&event(2, 0, Some(json!("old")))).unwrap(),
            Decision::KeepLocal
        );
        let mut unknown = event(9, 0, None);
        unknown.entity_id = "never-seen".into();
        assert_eq!(f.reconciler.reconcile(&unknown).unwrap(), Decision::KeepLocal);
        assert!(f.store.version_record(&acme(), &EntityKey::new(Table::Tasks, "never-seen")).unwrap().is_none());
    }

    #[test]
    fn remote_delete_of_clean_entity_removes_it() {
        let f = fixture(ConflictPolicy::default());
        seed(&f, 2, 2);
        f.reconciler.reconcile(&event(3, 0, None)).unwrap();
        assert!(matches!(
            f.store.read(&acme(), Table::Tasks, "task-1"),
            Err(CoreError::EntityNotFound { .. })
        ));
        // A redelivered older update cannot resurrect it.
        f.reconciler.reconcile(&event(2, 0, Some(json!("late")))).unwrap();
        assert!(f.store.read(&acme(), Table::Tasks, "task-1").is_err());
    }

    #[test]
    fn foreign_tenant_and_table_are_refused() {
        let f = fixture(ConflictPolicy::default());
        let mut foreign = event(1, 0, Some(json!("x")));
        foreign.tenant_id = "globex".into();
        assert!(matches!(
            f.reconciler.reconcile(&foreign),
            Err(SyncError::Core(CoreError::ScopeViolation { .. }))
        ));
        let mut unknown = event(1, 0, Some(json!("x")));
        unknown.table = "billing_codes".into();
        assert!(matches!(f.reconciler.reconcile(&unknown), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn snapshot_pass_counts_outcomes() {
        let f = fixture(ConflictPolicy::default());
        seed(&f, 2, 2);
        f.store.write(&acme(), Table::Tasks, "synced-only-here", json!({})).unwrap();
        f.store
            .mark_synced(&acme(), &EntityKey::new(Table::Tasks, "synced-only-here"), 1)
            .unwrap();

        let rows = vec![
            RemoteRow {
                id: "task-1".into(),
                table: "tasks".into(),
                tenant_id: "acme".into(),
                version: 3,
                payload: Some(json!("remote")),
                updated_at: 0,
                deleted: false,
            },
            RemoteRow {
                id: "task-2".into(),
                table: "tasks".into(),
                tenant_id: "acme".into(),
                version: 1,
                payload: Some(json!("new")),
                updated_at: 0,
                deleted: false,
            },
        ];
        let report = f.reconciler.reconcile_rows(Table::Tasks, rows).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.missing_remotely, 1);
        assert_eq!(f.store.read(&acme(), Table::Tasks, "task-2").unwrap().payload, json!("new"));
    }
}
