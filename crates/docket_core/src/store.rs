//! The tenant-scoped local store.
//!
//! A [`LocalStore`] serves one tenant of one device. Entity records and
//! version records are loaded into memory on open and every mutation is
//! committed to the backend as a single [`WriteBatch`] holding the entity,
//! its version record, its dirty marker and the last-saved marker, so a
//! reader never observes a version without the payload that produced it.
//!
//! ## Concurrency
//!
//! Writes are optimistic. A writer observes the entity's current version,
//! then commits against it; if another writer got there first the commit
//! fails with [`CoreError::VersionConflict`] and [`LocalStore::write`]
//! retries with the new version. The compare-and-commit step is serialized
//! per entity by a striped mutex, so writes to different entities proceed
//! independently.

use crate::change_feed::{ChangeFeed, ChangeKind, ChangeOrigin};
use crate::config::StoreConfig;
use crate::entity::EntityRecord;
use crate::error::{CoreError, CoreResult};
use crate::gate::InitGate;
use crate::keys::TenantKeys;
use crate::types::{now_millis, EntityKey, Table, TenantId};
use crate::version::{VersionRecord, VersionTracker};
use docket_codec::{from_cbor, to_cbor};
use docket_storage::{KvBackend, WriteBatch};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STRIPES: usize = 64;

/// A change coming from the remote, ready to be installed.
///
/// Built by reconciliation; the store only checks that it applies to the
/// version reconciliation looked at and that versions keep increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteApply {
    /// The entity to change.
    pub key: EntityKey,
    /// New payload, or `None` if the entity is deleted.
    pub payload: Option<Value>,
    /// Version to install. Must exceed the current local version.
    pub version: u64,
    /// Version the remote is known to hold after this change.
    pub synced_version: u64,
    /// Timestamp to record on the entity.
    pub updated_at: u64,
    /// Local version reconciliation decided against.
    pub expected_local: u64,
}

/// An entity with unacknowledged changes, as found when opening.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyEntry {
    /// The entity.
    pub key: EntityKey,
    /// Its current record; `None` only if the record itself was lost.
    pub record: Option<EntityRecord>,
    /// Its version record.
    pub versions: VersionRecord,
}

/// What [`LocalStore::load`] found.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Entity records loaded, tombstones included.
    pub entities: usize,
    /// Entities with unacknowledged changes.
    pub dirty: Vec<DirtyEntry>,
    /// Version records or dirty markers that had to be repaired.
    pub repaired: usize,
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<EntityKey, EntityRecord>,
    versions: VersionTracker,
}

enum LocalChange {
    Put(Value),
    Tombstone,
}

/// Durable, tenant-scoped record storage.
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    keys: TenantKeys,
    gate: Arc<InitGate>,
    feed: Arc<ChangeFeed>,
    config: StoreConfig,
    state: RwLock<StoreState>,
    stripes: Vec<Mutex<()>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("tenant", self.keys.tenant())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Loads the store of one tenant from `backend`.
    ///
    /// Called while the gate is `Opening`; the store rejects every
    /// operation until the gate is marked ready. Version records missing
    /// or behind their entity are repaired, and the dirty index is
    /// rebuilt from version records where it disagrees with them.
    ///
    /// # Errors
    ///
    /// Returns `StorageCorruption` if a persisted record cannot be decoded
    /// or addressed, and storage errors from the backend.
    pub fn load(
        backend: Arc<dyn KvBackend>,
        keys: TenantKeys,
        gate: Arc<InitGate>,
        feed: Arc<ChangeFeed>,
        config: StoreConfig,
    ) -> CoreResult<(Self, LoadReport)> {
        let mut state = StoreState::default();
        let mut repair = WriteBatch::new();
        let mut repaired = 0usize;

        for (raw_key, bytes) in backend.scan_prefix(&keys.versions_prefix(None))? {
            let key = parse_key(&keys, &raw_key)?;
            let record: VersionRecord = decode(&raw_key, &bytes)?;
            state.versions.set(key, record);
        }

        for (raw_key, bytes) in backend.scan_prefix(&keys.entities_prefix(None))? {
            let key = parse_key(&keys, &raw_key)?;
            let record: EntityRecord = decode(&raw_key, &bytes)?;
            if record.key() != key || &record.tenant_id != keys.tenant() {
                return Err(CoreError::corruption(format!(
                    "record stored under {raw_key} belongs to {}/{}",
                    record.tenant_id,
                    record.key()
                )));
            }

            let versions = state.versions.get(&key).unwrap_or_default();
            if versions.local_version < record.version {
                warn!(entity = %key, stored = versions.local_version, record = record.version, "repairing version record");
                let fixed = VersionRecord {
                    local_version: record.version,
                    synced_version: versions.synced_version.min(record.version),
                };
                repair.put(keys.version(&key), to_cbor(&fixed)?);
                state.versions.set(key.clone(), fixed);
                repaired += 1;
            }
            state.records.insert(key, record);
        }

        let persisted_dirty: BTreeSet<EntityKey> = backend
            .scan_prefix(&keys.dirty_prefix(None))?
            .into_iter()
            .map(|(raw_key, _)| parse_key(&keys, &raw_key))
            .collect::<CoreResult<_>>()?;
        let actual_dirty: BTreeSet<EntityKey> = state.versions.list_dirty(None).into_iter().collect();

        for key in actual_dirty.difference(&persisted_dirty) {
            repair.put(keys.dirty(key), Vec::new());
            repaired += 1;
        }
        for key in persisted_dirty.difference(&actual_dirty) {
            repair.delete(keys.dirty(key));
            repaired += 1;
        }

        if !repair.is_empty() {
            warn!(tenant = %keys.tenant(), repaired, "repaired version bookkeeping on open");
            backend.commit(repair)?;
        }

        let dirty = actual_dirty
            .into_iter()
            .map(|key| DirtyEntry {
                record: state.records.get(&key).cloned(),
                versions: state.versions.get(&key).unwrap_or_default(),
                key,
            })
            .collect::<Vec<_>>();

        let report = LoadReport {
            entities: state.records.len(),
            dirty,
            repaired,
        };
        info!(
            tenant = %keys.tenant(),
            entities = report.entities,
            dirty = report.dirty.len(),
            "local store loaded"
        );

        let store = Self {
            backend,
            keys,
            gate,
            feed,
            config,
            state: RwLock::new(state),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        };
        Ok((store, report))
    }

    /// Returns the tenant this store serves.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        self.keys.tenant()
    }

    /// Returns the keys of this store's tenant.
    #[must_use]
    pub fn keys(&self) -> &TenantKeys {
        &self.keys
    }

    /// Returns the backend this store writes to.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Writes an entity and returns its new version.
    ///
    /// Retries up to `write_retry_limit` times if concurrent writers keep
    /// moving the version.
    ///
    /// # Errors
    ///
    /// `NotReady`, `ScopeViolation`, `WriteContention`, or storage errors.
    pub fn write(&self, tenant: &TenantId, table: Table, id: &str, payload: Value) -> CoreResult<u64> {
        let key = EntityKey::new(table, id);
        self.retrying(tenant, &key, |expected| {
            self.commit_local(tenant, &key, expected, LocalChange::Put(payload.clone()))
        })
    }

    /// Writes an entity if its current version is `expected`.
    ///
    /// `expected` is 0 for an entity that has never been written.
    ///
    /// # Errors
    ///
    /// `VersionConflict` if the entity moved on, plus the errors of
    /// [`LocalStore::write`].
    pub fn write_if(
        &self,
        tenant: &TenantId,
        table: Table,
        id: &str,
        payload: Value,
        expected: u64,
    ) -> CoreResult<u64> {
        self.commit_local(tenant, &EntityKey::new(table, id), expected, LocalChange::Put(payload))
    }

    /// Deletes an entity, leaving a tombstone until the delete is
    /// acknowledged. Returns the tombstone's version.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if there is no live entity, plus the errors of
    /// [`LocalStore::write`].
    pub fn delete(&self, tenant: &TenantId, table: Table, id: &str) -> CoreResult<u64> {
        let key = EntityKey::new(table, id);
        self.retrying(tenant, &key, |expected| {
            self.commit_local(tenant, &key, expected, LocalChange::Tombstone)
        })
    }

    /// Reads a live entity.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if the entity does not exist or is deleted.
    pub fn read(&self, tenant: &TenantId, table: Table, id: &str) -> CoreResult<EntityRecord> {
        self.guard(tenant)?;
        let key = EntityKey::new(table, id);
        self.state
            .read()
            .records
            .get(&key)
            .filter(|r| r.is_live())
            .cloned()
            .ok_or(CoreError::EntityNotFound { key })
    }

    /// Returns every live entity of `table`, ordered by ID.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn scan(&self, tenant: &TenantId, table: Table) -> CoreResult<Vec<EntityRecord>> {
        self.guard(tenant)?;
        let state = self.state.read();
        Ok(state
            .records
            .range(EntityKey::new(table, "")..)
            .take_while(|(k, _)| k.table == table)
            .filter(|(_, r)| r.is_live())
            .map(|(_, r)| r.clone())
            .collect())
    }

    /// Returns the stored record of `key`, tombstones included.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn record(&self, tenant: &TenantId, key: &EntityKey) -> CoreResult<Option<EntityRecord>> {
        self.guard(tenant)?;
        Ok(self.state.read().records.get(key).cloned())
    }

    /// Returns the version record of `key`.
    ///
    /// The record outlives the entity: it stays after a tombstone is
    /// purged so later versions continue the sequence.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn version_record(&self, tenant: &TenantId, key: &EntityKey) -> CoreResult<Option<VersionRecord>> {
        self.guard(tenant)?;
        Ok(self.state.read().versions.get(key))
    }

    /// Returns true if `key` has unacknowledged local changes.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn is_dirty(&self, tenant: &TenantId, key: &EntityKey) -> CoreResult<bool> {
        self.guard(tenant)?;
        Ok(self.state.read().versions.is_dirty(key))
    }

    /// Lists dirty entities, optionally restricted to one table.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn list_dirty(&self, tenant: &TenantId, table: Option<Table>) -> CoreResult<Vec<EntityKey>> {
        self.guard(tenant)?;
        Ok(self.state.read().versions.list_dirty(table))
    }

    /// Lists every entity with a version record, with that record.
    ///
    /// # Errors
    ///
    /// `NotReady` or `ScopeViolation`.
    pub fn known_versions(
        &self,
        tenant: &TenantId,
        table: Table,
    ) -> CoreResult<Vec<(EntityKey, VersionRecord)>> {
        self.guard(tenant)?;
        Ok(self
            .state
            .read()
            .versions
            .iter()
            .filter(|(k, _)| k.table == table)
            .map(|(k, r)| (k.clone(), *r))
            .collect())
    }

    /// Records that the remote acknowledged `version` of `key`.
    ///
    /// Monotonic and idempotent. Once a tombstone is acknowledged the
    /// entity record is removed; its version record is kept.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if the entity was never versioned, plus the
    /// errors of [`LocalStore::write`].
    pub fn mark_synced(&self, tenant: &TenantId, key: &EntityKey, version: u64) -> CoreResult<VersionRecord> {
        self.guard(tenant)?;
        let _stripe = self.stripe(key).lock();

        let (current, tombstone) = {
            let state = self.state.read();
            let current = state
                .versions
                .get(key)
                .ok_or_else(|| CoreError::EntityNotFound { key: key.clone() })?;
            (current, state.records.get(key).is_some_and(|r| r.tombstone))
        };

        let updated = current.synced_to(version.min(current.local_version));
        if updated == current {
            return Ok(current);
        }

        let purge = tombstone && !updated.is_dirty();
        let mut batch = WriteBatch::new();
        batch.put(self.keys.version(key), to_cbor(&updated)?);
        if !updated.is_dirty() {
            batch.delete(self.keys.dirty(key));
        }
        if purge {
            batch.delete(self.keys.entity(key));
        }
        self.backend.commit(batch)?;

        {
            let mut state = self.state.write();
            state.versions.mark_synced(key, updated.synced_version);
            if purge {
                state.records.remove(key);
            }
        }

        debug!(tenant = %tenant, entity = %key, synced = updated.synced_version, purge, "marked synced");
        Ok(updated)
    }

    /// Installs a reconciled remote change.
    ///
    /// Publishes exactly one change event (origin `Remote`) when the
    /// visible entity changes. Returns the installed version.
    ///
    /// # Errors
    ///
    /// `VersionConflict` if the entity moved since reconciliation looked at
    /// it, `InvalidOperation` if the version would not increase, plus the
    /// errors of [`LocalStore::write`].
    pub fn apply_remote(&self, tenant: &TenantId, change: RemoteApply) -> CoreResult<u64> {
        self.guard(tenant)?;
        let key = &change.key;
        let _stripe = self.stripe(key).lock();

        let (current, previous) = {
            let state = self.state.read();
            (
                state.versions.get(key).unwrap_or_default(),
                state.records.get(key).cloned(),
            )
        };

        if current.local_version != change.expected_local {
            return Err(CoreError::VersionConflict {
                key: key.clone(),
                expected: change.expected_local,
                actual: current.local_version,
            });
        }
        if change.version <= current.local_version {
            return Err(CoreError::invalid_operation(format!(
                "remote change for {key} would move version from {} to {}",
                current.local_version, change.version
            )));
        }

        let versions = VersionRecord {
            local_version: change.version,
            synced_version: current.synced_version.max(change.synced_version.min(change.version)),
        };
        let was_live = previous.as_ref().is_some_and(EntityRecord::is_live);
        let now = now_millis();

        let mut batch = WriteBatch::new();
        let installed = match change.payload {
            Some(payload) => Some(EntityRecord {
                id: key.id.clone(),
                table: key.table,
                tenant_id: tenant.clone(),
                payload,
                version: change.version,
                updated_at: change.updated_at,
                tombstone: false,
            }),
            // A remote delete that is already acknowledged leaves nothing
            // to push, so the record goes away at once.
            None if !versions.is_dirty() => None,
            None => Some(EntityRecord {
                id: key.id.clone(),
                table: key.table,
                tenant_id: tenant.clone(),
                payload: Value::Null,
                version: change.version,
                updated_at: change.updated_at,
                tombstone: true,
            }),
        };

        match &installed {
            Some(record) => batch.put(self.keys.entity(key), to_cbor(record)?),
            None => batch.delete(self.keys.entity(key)),
        };
        batch.put(self.keys.version(key), to_cbor(&versions)?);
        if versions.is_dirty() {
            batch.put(self.keys.dirty(key), Vec::new());
        } else {
            batch.delete(self.keys.dirty(key));
        }
        batch.put(self.keys.last_saved(), to_cbor(&now)?);
        self.backend.commit(batch)?;

        let is_live = installed.as_ref().is_some_and(EntityRecord::is_live);
        {
            let mut state = self.state.write();
            match installed {
                Some(record) => {
                    state.records.insert(key.clone(), record);
                }
                None => {
                    state.records.remove(key);
                }
            }
            state.versions.set(key.clone(), versions);
        }

        let kind = match (was_live, is_live) {
            (false, true) => Some(ChangeKind::Insert),
            (true, true) => Some(ChangeKind::Update),
            (true, false) => Some(ChangeKind::Delete),
            (false, false) => None,
        };
        if let Some(kind) = kind {
            self.feed
                .publish(tenant.clone(), key.clone(), kind, change.version, ChangeOrigin::Remote);
        }

        debug!(tenant = %tenant, entity = %key, version = change.version, dirty = versions.is_dirty(), "applied remote change");
        Ok(change.version)
    }

    /// Returns when the last batch was committed (Unix milliseconds).
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn last_saved(&self) -> CoreResult<Option<u64>> {
        self.backend
            .get(&self.keys.last_saved())?
            .map(|bytes| from_cbor(&bytes).map_err(CoreError::from))
            .transpose()
    }

    /// Returns the number of entity records held, tombstones included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.state.read().records.len()
    }

    fn retrying(
        &self,
        tenant: &TenantId,
        key: &EntityKey,
        mut attempt: impl FnMut(u64) -> CoreResult<u64>,
    ) -> CoreResult<u64> {
        let limit = self.config.write_retry_limit.max(1);
        for n in 1..=limit {
            self.guard(tenant)?;
            let observed = self.state.read().versions.local_version(key);
            match attempt(observed) {
                Err(CoreError::VersionConflict { actual, .. }) => {
                    debug!(entity = %key, attempt = n, observed, actual, "write lost version race, retrying");
                }
                other => return other,
            }
        }
        warn!(entity = %key, attempts = limit, "write retry budget exhausted");
        Err(CoreError::WriteContention {
            key: key.clone(),
            attempts: limit,
        })
    }

    fn commit_local(
        &self,
        tenant: &TenantId,
        key: &EntityKey,
        expected: u64,
        change: LocalChange,
    ) -> CoreResult<u64> {
        self.guard(tenant)?;
        let _stripe = self.stripe(key).lock();

        let (current, previous) = {
            let state = self.state.read();
            (
                state.versions.get(key).unwrap_or_default(),
                state.records.get(key).cloned(),
            )
        };
        if current.local_version != expected {
            return Err(CoreError::VersionConflict {
                key: key.clone(),
                expected,
                actual: current.local_version,
            });
        }

        let was_live = previous.as_ref().is_some_and(EntityRecord::is_live);
        let (payload, tombstone, kind) = match change {
            LocalChange::Put(payload) => {
                let kind = if was_live { ChangeKind::Update } else { ChangeKind::Insert };
                (payload, false, kind)
            }
            LocalChange::Tombstone if was_live => (Value::Null, true, ChangeKind::Delete),
            LocalChange::Tombstone => return Err(CoreError::EntityNotFound { key: key.clone() }),
        };

        let version = current.next_version();
        let now = now_millis();
        let record = EntityRecord {
            id: key.id.clone(),
            table: key.table,
            tenant_id: tenant.clone(),
            payload,
            version,
            updated_at: now,
            tombstone,
        };
        let versions = VersionRecord {
            local_version: version,
            synced_version: current.synced_version,
        };

        let mut batch = WriteBatch::new();
        batch
            .put(self.keys.entity(key), to_cbor(&record)?)
            .put(self.keys.version(key), to_cbor(&versions)?)
            .put(self.keys.dirty(key), Vec::new())
            .put(self.keys.last_saved(), to_cbor(&now)?);
        self.backend.commit(batch)?;

        {
            let mut state = self.state.write();
            let bumped = state.versions.bump(key);
            debug_assert_eq!(bumped, version);
            state.records.insert(key.clone(), record);
        }

        self.feed
            .publish(tenant.clone(), key.clone(), kind, version, ChangeOrigin::Local);
        debug!(tenant = %tenant, entity = %key, version, ?kind, "local write committed");
        Ok(version)
    }

    fn guard(&self, tenant: &TenantId) -> CoreResult<()> {
        self.gate.ensure_ready()?;
        if tenant == self.keys.tenant() {
            return Ok(());
        }
        error!(active = %self.keys.tenant(), requested = %tenant, "cross-tenant access rejected");
        if self.config.panic_on_scope_violation {
            panic!(
                "scope violation: store for tenant {} accessed as {}",
                self.keys.tenant(),
                tenant
            );
        }
        Err(CoreError::ScopeViolation {
            active: self.keys.tenant().clone(),
            requested: tenant.clone(),
        })
    }

    fn stripe(&self, key: &EntityKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

fn parse_key(keys: &TenantKeys, raw_key: &str) -> CoreResult<EntityKey> {
    keys.parse_entity_key(raw_key)
        .ok_or_else(|| CoreError::corruption(format!("unrecognised key {raw_key}")))
}

fn decode<T: serde::de::DeserializeOwned>(raw_key: &str, bytes: &[u8]) -> CoreResult<T> {
    from_cbor(bytes).map_err(|e| CoreError::corruption(format!("cannot decode {raw_key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keyspace;
    use crate::types::DeviceId;
    use docket_storage::MemoryBackend;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn open_with(backend: Arc<dyn KvBackend>, config: StoreConfig) -> (LocalStore, LoadReport) {
        let gate = Arc::new(InitGate::new());
        gate.begin_opening().unwrap();
        let keys = Keyspace::new(&DeviceId::new("dev")).tenant(&tenant());
        let loaded = LocalStore::load(backend, keys, Arc::clone(&gate), Arc::new(ChangeFeed::new()), config).unwrap();
        gate.mark_ready().unwrap();
        loaded
    }

    fn open() -> LocalStore {
        open_with(Arc::new(MemoryBackend::new()), StoreConfig::default()).0
    }

    #[test]
    fn write_then_read() {
        let store = open();
        let v = store.write(&tenant(), Table::Tasks, "task-1", json!({"title": "File motion"})).unwrap();
        assert_eq!(v, 1);
        let record = store.read(&tenant(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload["title"], "File motion");
        assert_eq!(record.version, 1);
        assert!(store.is_dirty(&tenant(), &record.key()).unwrap());
    }

    #[test]
    fn versions_increase_by_one() {
        let store = open();
        for expected in 1..=5 {
            let v = store.write(&tenant(), Table::Cases, "c", json!(expected)).unwrap();
            assert_eq!(v, expected);
        }
    }

    #[test]
    fn write_if_detects_conflict() {
        let store = open();
        store.write_if(&tenant(), Table::Notes, "n", json!(1), 0).unwrap();
        let err = store.write_if(&tenant(), Table::Notes, "n", json!(2), 0).unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { expected: 0, actual: 1, .. }));
    }

    #[test]
    fn delete_leaves_tombstone_until_acked() {
        let store = open();
        let key = EntityKey::new(Table::Tasks, "t");
        store.write(&tenant(), Table::Tasks, "t", json!({})).unwrap();
        let v = store.delete(&tenant(), Table::Tasks, "t").unwrap();
        assert_eq!(v, 2);
        assert!(matches!(
            store.read(&tenant(), Table::Tasks, "t"),
            Err(CoreError::EntityNotFound { .. })
        ));
        assert!(store.record(&tenant(), &key).unwrap().unwrap().tombstone);
        assert!(store.scan(&tenant(), Table::Tasks).unwrap().is_empty());

        store.mark_synced(&tenant(), &key, 2).unwrap();
        assert!(store.record(&tenant(), &key).unwrap().is_none());
        // The watermark survives the purge
        assert_eq!(store.version_record(&tenant(), &key).unwrap().unwrap().local_version, 2);
        assert_eq!(store.write(&tenant(), Table::Tasks, "t", json!({})).unwrap(), 3);
    }

    #[test]
    fn delete_missing_entity_fails() {
        let store = open();
        assert!(matches!(
            store.delete(&tenant(), Table::Tasks, "ghost"),
            Err(CoreError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn other_tenants_are_rejected() {
        let store = open();
        let other = TenantId::new("globex");
        assert!(matches!(
            store.read(&other, Table::Tasks, "x"),
            Err(CoreError::ScopeViolation { .. })
        ));
        assert!(matches!(
            store.write(&other, Table::Tasks, "x", json!(1)),
            Err(CoreError::ScopeViolation { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "scope violation")]
    fn scope_violation_can_panic() {
        let (store, _) = open_with(
            Arc::new(MemoryBackend::new()),
            StoreConfig::default().panic_on_scope_violation(true),
        );
        let _ = store.scan(&TenantId::new("globex"), Table::Tasks);
    }

    #[test]
    fn operations_fail_until_ready() {
        let gate = Arc::new(InitGate::new());
        gate.begin_opening().unwrap();
        let keys = Keyspace::new(&DeviceId::new("dev")).tenant(&tenant());
        let (store, _) = LocalStore::load(
            Arc::new(MemoryBackend::new()),
            keys,
            Arc::clone(&gate),
            Arc::new(ChangeFeed::new()),
            StoreConfig::default(),
        )
        .unwrap();
        assert!(matches!(store.scan(&tenant(), Table::Tasks), Err(CoreError::NotReady)));
        gate.mark_ready().unwrap();
        store.scan(&tenant(), Table::Tasks).unwrap();
        gate.reset();
        assert!(matches!(store.read(&tenant(), Table::Tasks, "x"), Err(CoreError::NotReady)));
    }

    #[test]
    fn mark_synced_is_monotonic() {
        let store = open();
        let key = EntityKey::new(Table::Tasks, "t");
        for _ in 0..3 {
            store.write(&tenant(), Table::Tasks, "t", json!(1)).unwrap();
        }
        store.mark_synced(&tenant(), &key, 2).unwrap();
        let record = store.mark_synced(&tenant(), &key, 1).unwrap();
        assert_eq!(record.synced_version, 2);
        assert!(store.is_dirty(&tenant(), &key).unwrap());
        store.mark_synced(&tenant(), &key, 3).unwrap();
        assert!(store.list_dirty(&tenant(), None).unwrap().is_empty());
    }

    #[test]
    fn writes_publish_events() {
        let feed = Arc::new(ChangeFeed::new());
        let gate = Arc::new(InitGate::new());
        gate.begin_opening().unwrap();
        let keys = Keyspace::new(&DeviceId::new("dev")).tenant(&tenant());
        let (store, _) = LocalStore::load(
            Arc::new(MemoryBackend::new()),
            keys,
            Arc::clone(&gate),
            Arc::clone(&feed),
            StoreConfig::default(),
        )
        .unwrap();
        gate.mark_ready().unwrap();
        let rx = feed.subscribe();

        store.write(&tenant(), Table::Tasks, "t", json!(1)).unwrap();
        store.write(&tenant(), Table::Tasks, "t", json!(2)).unwrap();
        store.delete(&tenant(), Table::Tasks, "t").unwrap();

        let kinds: Vec<ChangeKind> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[test]
    fn apply_remote_installs_clean_version() {
        let store = open();
        let key = EntityKey::new(Table::Tasks, "task-1");
        for _ in 0..3 {
            store.write(&tenant(), Table::Tasks, "task-1", json!("local")).unwrap();
        }
        store.mark_synced(&tenant(), &key, 3).unwrap();

        store
            .apply_remote(
                &tenant(),
                RemoteApply {
                    key: key.clone(),
                    payload: Some(json!("remote")),
                    version: 4,
                    synced_version: 4,
                    updated_at: 10,
                    expected_local: 3,
                },
            )
            .unwrap();

        let record = store.read(&tenant(), Table::Tasks, "task-1").unwrap();
        assert_eq!(record.payload, json!("remote"));
        assert_eq!(record.version, 4);
        let versions = store.version_record(&tenant(), &key).unwrap().unwrap();
        assert_eq!(versions.synced_version, 4);
        assert!(!versions.is_dirty());
    }

    #[test]
    fn apply_remote_rejects_stale_expectation() {
        let store = open();
        store.write(&tenant(), Table::Tasks, "t", json!(1)).unwrap();
        let err = store
            .apply_remote(
                &tenant(),
                RemoteApply {
                    key: EntityKey::new(Table::Tasks, "t"),
                    payload: Some(json!(2)),
                    version: 5,
                    synced_version: 5,
                    updated_at: 0,
                    expected_local: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { .. }));
    }

    #[test]
    fn acknowledged_remote_delete_removes_record() {
        let store = open();
        let key = EntityKey::new(Table::Cases, "c");
        store.write(&tenant(), Table::Cases, "c", json!(1)).unwrap();
        store.mark_synced(&tenant(), &key, 1).unwrap();
        store
            .apply_remote(
                &tenant(),
                RemoteApply {
                    key: key.clone(),
                    payload: None,
                    version: 2,
                    synced_version: 2,
                    updated_at: 0,
                    expected_local: 1,
                },
            )
            .unwrap();
        assert!(store.record(&tenant(), &key).unwrap().is_none());
        assert_eq!(store.version_record(&tenant(), &key).unwrap().unwrap().local_version, 2);
    }

    #[test]
    fn reload_reports_dirty_entities() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        {
            let (store, _) = open_with(Arc::clone(&backend), StoreConfig::default());
            store.write(&tenant(), Table::Tasks, "a", json!(1)).unwrap();
            store.write(&tenant(), Table::Tasks, "b", json!(1)).unwrap();
            store.mark_synced(&tenant(), &EntityKey::new(Table::Tasks, "b"), 1).unwrap();
            assert!(store.last_saved().unwrap().is_some());
        }
        let (store, report) = open_with(backend, StoreConfig::default());
        assert_eq!(report.entities, 2);
        assert_eq!(report.dirty.len(), 1);
        assert_eq!(report.dirty[0].key.id, "a");
        assert_eq!(report.repaired, 0);
        assert_eq!(store.read(&tenant(), Table::Tasks, "b").unwrap().version, 1);
    }

    #[test]
    fn stale_dirty_index_is_repaired() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let keys = Keyspace::new(&DeviceId::new("dev")).tenant(&tenant());
        {
            let (store, _) = open_with(Arc::clone(&backend), StoreConfig::default());
            store.write(&tenant(), Table::Tasks, "a", json!(1)).unwrap();
        }
        // Lose the marker of a dirty entity, invent one for an unknown entity
        let mut batch = WriteBatch::new();
        batch.delete(keys.dirty(&EntityKey::new(Table::Tasks, "a")));
        batch.put(keys.dirty(&EntityKey::new(Table::Tasks, "ghost")), Vec::new());
        backend.commit(batch).unwrap();

        let (_, report) = open_with(Arc::clone(&backend), StoreConfig::default());
        assert_eq!(report.repaired, 2);
        assert_eq!(report.dirty.len(), 1);
        assert!(backend.get(&keys.dirty(&EntityKey::new(Table::Tasks, "a"))).unwrap().is_some());
        assert!(backend.get(&keys.dirty(&EntityKey::new(Table::Tasks, "ghost"))).unwrap().is_none());
    }

    #[test]
    fn undecodable_record_is_corruption() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let keys = Keyspace::new(&DeviceId::new("dev")).tenant(&tenant());
        let mut batch = WriteBatch::new();
        batch.put(keys.entity(&EntityKey::new(Table::Tasks, "x")), vec![0xff, 0x00]);
        backend.commit(batch).unwrap();

        let gate = Arc::new(InitGate::new());
        let err = LocalStore::load(backend, keys, gate, Arc::new(ChangeFeed::new()), StoreConfig::default())
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn concurrent_writers_never_share_a_version() {
        let (store, _) = open_with(
            Arc::new(MemoryBackend::new()),
            StoreConfig::default().write_retry_limit(10_000),
        );
        let store = Arc::new(store);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| store.write(&tenant(), Table::Tasks, "hot", json!(i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut versions: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=100).collect::<Vec<_>>());
    }
}
