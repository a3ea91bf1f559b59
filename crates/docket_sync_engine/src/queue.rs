//! Durable, coalescing outbound queue.
//!
//! One queue per tenant. Items are persisted under the tenant's `queue/`
//! keys, ordered by a monotonically increasing operation ID whose high
//! water mark lives in `queue_seq`. At most one item per entity is
//! *pending* (not yet handed to the worker): a second enqueue for the
//! same entity folds into it, keeping the newest payload and the oldest
//! `enqueued_at`.
//!
//! Items for the same entity are released strictly in op-ID order; an
//! item waiting out a backoff holds back the later items of its entity.

use crate::error::{SyncError, SyncResult};
use docket_codec::{from_cbor, to_cbor};
use docket_core::{now_millis, CoreError, DirtyEntry, EntityKey, TenantKeys};
use docket_storage::{KvBackend, WriteBatch};
use docket_sync_protocol::{OpType, OutboundOp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One pending push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Queue-assigned ID; also the FIFO position.
    pub op_id: u64,
    /// Entity to push.
    pub key: EntityKey,
    /// What the push does.
    pub op_type: OpType,
    /// Payload snapshot; `None` for deletes.
    pub payload: Option<Value>,
    /// Local version the snapshot corresponds to.
    pub version: u64,
    /// When the local change was made (Unix milliseconds).
    pub updated_at: u64,
    /// Failed push attempts so far.
    pub attempts: u32,
    /// Last failure, if any.
    pub last_error: Option<String>,
    /// When the entity first entered the queue (Unix milliseconds).
    pub enqueued_at: u64,
    /// Earliest time of the next attempt (Unix milliseconds).
    pub next_attempt_at: u64,
}

impl QueueItem {
    /// Builds the wire operation for this item.
    #[must_use]
    pub fn to_op(&self, tenant: &str) -> OutboundOp {
        OutboundOp {
            op_id: self.op_id,
            tenant_id: tenant.to_string(),
            table: self.key.table.as_str().to_string(),
            entity_id: self.key.id.clone(),
            op_type: self.op_type,
            payload: self.payload.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// A push that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The item as it was when parked.
    pub item: QueueItem,
    /// Why it was parked.
    pub reason: String,
    /// When it was parked (Unix milliseconds).
    pub dead_at: u64,
}

/// What [`SyncQueue::rebuild`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Dirty entities that had no queue item and got one.
    pub enqueued: usize,
    /// Dirty entities already covered by a queue item.
    pub covered: usize,
    /// Dirty entities held back by a dead letter.
    pub parked: usize,
    /// Dirty entities whose record is gone, so nothing can be pushed.
    pub missing: usize,
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<u64, QueueItem>,
    by_key: BTreeMap<EntityKey, BTreeSet<u64>>,
    in_flight: HashSet<u64>,
    dead: BTreeMap<u64, DeadLetter>,
    last_op_id: u64,
}

impl QueueState {
    fn insert(&mut self, item: QueueItem) {
        self.by_key.entry(item.key.clone()).or_default().insert(item.op_id);
        self.items.insert(item.op_id, item);
    }

    fn remove(&mut self, op_id: u64) -> Option<QueueItem> {
        let item = self.items.remove(&op_id)?;
        self.in_flight.remove(&op_id);
        if let Some(ids) = self.by_key.get_mut(&item.key) {
            ids.remove(&op_id);
            if ids.is_empty() {
                self.by_key.remove(&item.key);
            }
        }
        Some(item)
    }

    fn ids_for(&self, key: &EntityKey) -> Vec<u64> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The newest item of `key` not handed to the worker.
    fn pending_for(&self, key: &EntityKey) -> Option<u64> {
        self.by_key
            .get(key)?
            .iter()
            .next_back()
            .copied()
            .filter(|id| !self.in_flight.contains(id))
    }

    fn covers(&self, key: &EntityKey, version: u64) -> bool {
        self.ids_for(key)
            .iter()
            .filter_map(|id| self.items.get(id))
            .any(|item| item.version >= version)
    }
}

/// The outbound queue of one tenant.
pub struct SyncQueue {
    backend: Arc<dyn KvBackend>,
    keys: TenantKeys,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncQueue")
            .field("tenant", self.keys.tenant())
            .field("items", &state.items.len())
            .field("dead", &state.dead.len())
            .finish()
    }
}

impl SyncQueue {
    /// Loads the queue and dead letters of one tenant.
    ///
    /// # Errors
    ///
    /// Storage errors, or `StorageCorruption` if an item cannot be decoded.
    pub fn open(backend: Arc<dyn KvBackend>, keys: TenantKeys) -> SyncResult<Self> {
        let mut state = QueueState::default();

        for (raw_key, bytes) in backend.scan_prefix(&keys.queue_prefix())? {
            let item: QueueItem = decode(&raw_key, &bytes)?;
            state.last_op_id = state.last_op_id.max(item.op_id);
            state.insert(item);
        }
        for (raw_key, bytes) in backend.scan_prefix(&keys.dead_letter_prefix())? {
            let dead: DeadLetter = decode(&raw_key, &bytes)?;
            state.last_op_id = state.last_op_id.max(dead.item.op_id);
            state.dead.insert(dead.item.op_id, dead);
        }
        if let Some(bytes) = backend.get(&keys.queue_seq())? {
            let seq: u64 = decode(&keys.queue_seq(), &bytes)?;
            state.last_op_id = state.last_op_id.max(seq);
        }

        info!(
            tenant = %keys.tenant(),
            pending = state.items.len(),
            dead = state.dead.len(),
            "sync queue opened"
        );
        Ok(Self {
            backend,
            keys,
            state: Mutex::new(state),
        })
    }

    /// Queues a local change, folding it into a pending item of the same
    /// entity if there is one. Returns the ID of the item holding it.
    ///
    /// A change older than what is already queued for the entity is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Storage or codec errors; the queue is unchanged on error.
    pub fn enqueue(
        &self,
        key: EntityKey,
        op_type: OpType,
        payload: Option<Value>,
        version: u64,
        updated_at: u64,
    ) -> SyncResult<u64> {
        let mut state = self.state.lock();
        let now = now_millis();

        if let Some(op_id) = state.pending_for(&key) {
            let Some(existing) = state.items.get(&op_id) else {
                return Err(SyncError::UnknownOperation { op_id });
            };
            if version <= existing.version {
                debug!(entity = %key, op_id, version, queued = existing.version, "older change already covered");
                return Ok(op_id);
            }
            let mut merged = existing.clone();
            merged.op_type = existing.op_type.coalesce(op_type);
            merged.payload = payload;
            merged.version = version;
            merged.updated_at = updated_at;

            self.persist(&merged, None)?;
            debug!(entity = %key, op_id, version, op = %merged.op_type, "coalesced into pending item");
            state.insert(merged);
            return Ok(op_id);
        }

        if state.covers(&key, version) {
            debug!(entity = %key, version, "change already in flight");
            return state
                .ids_for(&key)
                .last()
                .copied()
                .ok_or(SyncError::UnknownOperation { op_id: 0 });
        }

        let op_id = state.last_op_id + 1;
        let item = QueueItem {
            op_id,
            key,
            op_type,
            payload,
            version,
            updated_at,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            next_attempt_at: now,
        };
        self.persist(&item, Some(op_id))?;
        state.last_op_id = op_id;
        debug!(entity = %item.key, op_id, version, op = %item.op_type, "enqueued");
        state.insert(item);
        Ok(op_id)
    }

    /// Hands up to `limit` due items to the caller and marks them in
    /// flight. At most one item per entity is in flight at a time.
    pub fn take_ready(&self, now: u64, limit: usize) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        let mut seen: HashSet<&EntityKey> = HashSet::new();
        let mut ready = Vec::new();

        for item in state.items.values() {
            if ready.len() >= limit {
                break;
            }
            if !seen.insert(&item.key) {
                continue;
            }
            if state.in_flight.contains(&item.op_id) || item.next_attempt_at > now {
                continue;
            }
            ready.push(item.clone());
        }
        for item in &ready {
            state.in_flight.insert(item.op_id);
        }
        ready
    }

    /// Returns when the next held-back item becomes due.
    pub fn next_due(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .by_key
            .values()
            .filter_map(|ids| ids.iter().next())
            .filter(|id| !state.in_flight.contains(id))
            .filter_map(|id| state.items.get(id))
            .map(|item| item.next_attempt_at)
            .min()
    }

    /// Removes an item the remote acknowledged.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn complete(&self, op_id: u64) -> SyncResult<Option<QueueItem>> {
        let mut state = self.state.lock();
        if !state.items.contains_key(&op_id) {
            return Ok(None);
        }
        let mut batch = WriteBatch::new();
        batch.delete(self.keys.queue_item(op_id));
        self.backend.commit(batch)?;
        Ok(state.remove(op_id))
    }

    /// Records a failed attempt and schedules the item for
    /// `next_attempt_at`. If a newer item of the same entity was queued
    /// meanwhile, the failed item is folded into it instead; the newer item
    /// inherits the attempt count and backoff so the retry ceiling still
    /// applies to the entity.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn record_failure(&self, op_id: u64, error: &str, next_attempt_at: u64) -> SyncResult<Option<QueueItem>> {
        let mut state = self.state.lock();
        let Some(mut item) = state.items.get(&op_id).cloned() else {
            return Ok(None);
        };

        let successor = state
            .ids_for(&item.key)
            .into_iter()
            .find(|id| *id > op_id)
            .and_then(|id| state.items.get(&id).cloned());

        if let Some(mut later) = successor {
            later.op_type = item.op_type.coalesce(later.op_type);
            later.enqueued_at = later.enqueued_at.min(item.enqueued_at);
            later.attempts = later.attempts.max(item.attempts.saturating_add(1));
            later.last_error = Some(error.to_string());
            later.next_attempt_at = later.next_attempt_at.max(next_attempt_at);
            let mut batch = WriteBatch::new();
            batch
                .delete(self.keys.queue_item(op_id))
                .put(self.keys.queue_item(later.op_id), to_cbor(&later)?);
            self.backend.commit(batch)?;
            debug!(entity = %item.key, op_id, into = later.op_id, "failed item folded into newer change");
            state.remove(op_id);
            state.insert(later.clone());
            return Ok(Some(later));
        }

        item.attempts = item.attempts.saturating_add(1);
        item.last_error = Some(error.to_string());
        item.next_attempt_at = next_attempt_at;
        self.persist(&item, None)?;
        state.in_flight.remove(&op_id);
        state.insert(item.clone());
        Ok(Some(item))
    }

    /// Returns an in-flight item to the queue unchanged.
    pub fn release(&self, op_id: u64) {
        self.state.lock().in_flight.remove(&op_id);
    }

    /// Returns every in-flight item to the queue unchanged.
    pub fn release_all(&self) {
        self.state.lock().in_flight.clear();
    }

    /// Moves an item to the dead letters.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn dead_letter(&self, op_id: u64, reason: &str) -> SyncResult<Option<DeadLetter>> {
        let mut state = self.state.lock();
        let Some(item) = state.items.get(&op_id).cloned() else {
            return Ok(None);
        };
        let dead = DeadLetter {
            item,
            reason: reason.to_string(),
            dead_at: now_millis(),
        };
        let mut batch = WriteBatch::new();
        batch
            .delete(self.keys.queue_item(op_id))
            .put(self.keys.dead_letter(op_id), to_cbor(&dead)?);
        self.backend.commit(batch)?;

        state.remove(op_id);
        state.dead.insert(op_id, dead.clone());
        Ok(Some(dead))
    }

    /// Drops queued items of `key` at or below `version` that are not in
    /// flight. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn drop_superseded(&self, key: &EntityKey, version: u64) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<u64> = state
            .ids_for(key)
            .into_iter()
            .filter(|id| !state.in_flight.contains(id))
            .filter(|id| state.items.get(id).is_some_and(|item| item.version <= version))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for id in &doomed {
            batch.delete(self.keys.queue_item(*id));
        }
        self.backend.commit(batch)?;
        for id in &doomed {
            state.remove(*id);
        }
        debug!(entity = %key, version, dropped = doomed.len(), "dropped superseded queue items");
        Ok(doomed.len())
    }

    /// Queues a dead letter again with a fresh retry budget. Returns the
    /// ID of the item now holding it.
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if there is no such dead letter, storage errors.
    pub fn requeue_dead_letter(&self, op_id: u64) -> SyncResult<u64> {
        let dead = self.discard_dead_letter(op_id)?;
        let item = dead.item;
        let new_id = self.enqueue(item.key, item.op_type, item.payload, item.version, item.updated_at)?;
        info!(op_id, new_id, "dead letter requeued");
        Ok(new_id)
    }

    /// Deletes a dead letter for good.
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if there is no such dead letter, storage errors.
    pub fn discard_dead_letter(&self, op_id: u64) -> SyncResult<DeadLetter> {
        let mut state = self.state.lock();
        if !state.dead.contains_key(&op_id) {
            return Err(SyncError::UnknownOperation { op_id });
        }
        let mut batch = WriteBatch::new();
        batch.delete(self.keys.dead_letter(op_id));
        self.backend.commit(batch)?;
        state.dead.remove(&op_id).ok_or(SyncError::UnknownOperation { op_id })
    }

    /// Returns true if a dead letter covers `version` of `key`.
    pub fn is_parked(&self, key: &EntityKey, version: u64) -> bool {
        self.state
            .lock()
            .dead
            .values()
            .any(|dead| &dead.item.key == key && dead.item.version >= version)
    }

    /// Makes sure every dirty entity has a queue item.
    ///
    /// Run while opening, with the dirty set found by the store. Entities
    /// already queued or parked are left alone.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn rebuild(&self, dirty: &[DirtyEntry]) -> SyncResult<RebuildReport> {
        let mut report = RebuildReport::default();
        for entry in dirty {
            let version = entry.versions.local_version;
            if self.state.lock().covers(&entry.key, version) {
                report.covered += 1;
                continue;
            }
            if self.is_parked(&entry.key, version) {
                report.parked += 1;
                continue;
            }
            let Some(record) = &entry.record else {
                warn!(entity = %entry.key, version, "dirty entity has no record; nothing to push");
                report.missing += 1;
                continue;
            };

            let (op_type, payload) = if record.tombstone {
                (OpType::Delete, None)
            } else if entry.versions.synced_version == 0 {
                (OpType::Create, Some(record.payload.clone()))
            } else {
                (OpType::Update, Some(record.payload.clone()))
            };
            self.enqueue(entry.key.clone(), op_type, payload, version, record.updated_at)?;
            report.enqueued += 1;
        }

        if report.enqueued > 0 {
            warn!(
                tenant = %self.keys.tenant(),
                enqueued = report.enqueued,
                "re-queued dirty entities missing from the queue"
            );
        }
        Ok(report)
    }

    /// Returns every queued item in FIFO order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.lock().items.values().cloned().collect()
    }

    /// Returns the queued items of one entity in FIFO order.
    pub fn items_for(&self, key: &EntityKey) -> Vec<QueueItem> {
        let state = self.state.lock();
        state
            .ids_for(key)
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    /// Returns every dead letter in op-ID order.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.values().cloned().collect()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of items handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn persist(&self, item: &QueueItem, seq: Option<u64>) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(self.keys.queue_item(item.op_id), to_cbor(item)?);
        if let Some(seq) = seq {
            batch.put(self.keys.queue_seq(), to_cbor(&seq)?);
        }
        self.backend.commit(batch)?;
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw_key: &str, bytes: &[u8]) -> SyncResult<T> {
    from_cbor(bytes)
        .map_err(|e| SyncError::Core(CoreError::corruption(format!("undecodable queue record {raw_key}: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{DeviceId, EntityRecord, Keyspace, Table, TenantId, VersionRecord};
    use docket_storage::MemoryBackend;
    use proptest::prelude::*;
    use serde_json::json;

    fn keys() -> TenantKeys {
        Keyspace::new(&DeviceId::new("laptop")).tenant(&TenantId::new("acme"))
    }

    fn queue() -> (Arc<dyn KvBackend>, SyncQueue) {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let queue = SyncQueue::open(Arc::clone(&backend), keys()).unwrap();
        (backend, queue)
    }

    fn task(id: &str) -> EntityKey {
        EntityKey::new(Table::Tasks, id)
    }

    fn put(queue: &SyncQueue, id: &str, op: OpType, version: u64) -> u64 {
        queue
            .enqueue(task(id), op, Some(json!({ "v": version })), version, version * 10)
            .unwrap()
    }

    #[test]
    fn op_ids_increase() {
        let (_, queue) = queue();
        let a = put(&queue, "a", OpType::Create, 1);
        let b = put(&queue, "b", OpType::Create, 1);
        assert!(b > a);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn two_writes_coalesce_into_one_item() {
        let (_, queue) = queue();
        let first = put(&queue, "a", OpType::Create, 1);
        let enqueued_at = queue.items()[0].enqueued_at;
        let second = put(&queue, "a", OpType::Update, 2);

        assert_eq!(first, second);
        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op_type, OpType::Create);
        assert_eq!(items[0].payload, Some(json!({"v": 2})));
        assert_eq!(items[0].version, 2);
        assert_eq!(items[0].enqueued_at, enqueued_at);
    }

    #[test]
    fn late_older_change_is_ignored() {
        let (_, queue) = queue();
        put(&queue, "a", OpType::Update, 3);
        put(&queue, "a", OpType::Update, 2);
        assert_eq!(queue.items()[0].version, 3);
    }

    #[test]
    fn queue_survives_reopen() {
        let (backend, queue) = queue();
        put(&queue, "a", OpType::Create, 1);
        let b = put(&queue, "b", OpType::Create, 1);
        queue.complete(b).unwrap();
        drop(queue);

        let reopened = SyncQueue::open(Arc::clone(&backend), keys()).unwrap();
        assert_eq!(reopened.len(), 1);
        let c = put(&reopened, "c", OpType::Create, 1);
        assert!(c > b, "op ids must not be reused after completion");
    }

    #[test]
    fn same_entity_is_released_in_order() {
        let (_, queue) = queue();
        put(&queue, "a", OpType::Create, 1);
        put(&queue, "b", OpType::Create, 1);

        let ready = queue.take_ready(u64::MAX, 10);
        assert_eq!(ready.len(), 2);
        // A write while "a" is in flight gets its own item behind it.
        let later = put(&queue, "a", OpType::Update, 2);
        assert!(queue.take_ready(u64::MAX, 10).is_empty());

        queue.complete(ready[0].op_id).unwrap();
        let next = queue.take_ready(u64::MAX, 10);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].op_id, later);
    }

    #[test]
    fn backoff_holds_back_the_entity() {
        let (_, queue) = queue();
        let a = put(&queue, "a", OpType::Create, 1);
        queue.take_ready(u64::MAX, 10);
        let retried = queue.record_failure(a, "timeout", 5_000).unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));

        assert!(queue.take_ready(4_999, 10).is_empty());
        assert_eq!(queue.next_due(), Some(5_000));
        assert_eq!(queue.take_ready(5_000, 10).len(), 1);
    }

    #[test]
    fn failed_item_folds_into_newer_change() {
        let (_, queue) = queue();
        let a = put(&queue, "a", OpType::Create, 1);
        queue.take_ready(u64::MAX, 10);
        let later = put(&queue, "a", OpType::Update, 2);

        let folded = queue.record_failure(a, "timeout", 0).unwrap().unwrap();
        assert_eq!(folded.op_id, later);
        assert_eq!(folded.op_type, OpType::Create);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn folding_keeps_the_attempt_count() {
        let (backend, queue) = queue();
        let a = put(&queue, "a", OpType::Update, 1);
        for _ in 0..3 {
            queue.take_ready(u64::MAX, 10);
            queue.record_failure(a, "timeout", 0).unwrap();
        }
        queue.take_ready(u64::MAX, 10);
        let later = put(&queue, "a", OpType::Update, 2);

        let due = now_millis() + 60_000;
        let folded = queue.record_failure(a, "timeout", due).unwrap().unwrap();
        assert_eq!(folded.op_id, later);
        assert_eq!(folded.attempts, 4);
        assert_eq!(folded.last_error.as_deref(), Some("timeout"));
        assert_eq!(folded.next_attempt_at, due);
        assert!(queue.take_ready(now_millis(), 10).is_empty());

        let reopened = SyncQueue::open(backend, keys()).unwrap();
        assert_eq!(reopened.items()[0].attempts, 4);
    }

    #[test]
    fn dead_letters_park_entities() {
        let (backend, queue) = queue();
        let a = put(&queue, "a", OpType::Create, 2);
        queue.take_ready(u64::MAX, 10);
        let dead = queue.dead_letter(a, "title is required").unwrap().unwrap();
        assert_eq!(dead.reason, "title is required");
        assert!(queue.is_empty());
        assert!(queue.is_parked(&task("a"), 2));
        assert!(!queue.is_parked(&task("a"), 3));

        let reopened = SyncQueue::open(Arc::clone(&backend), keys()).unwrap();
        assert_eq!(reopened.dead_letters().len(), 1);

        let requeued = reopened.requeue_dead_letter(a).unwrap();
        assert!(requeued > a);
        assert!(reopened.dead_letters().is_empty());
        assert_eq!(reopened.items()[0].attempts, 0);
        assert!(matches!(
            reopened.discard_dead_letter(a),
            Err(SyncError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn superseded_items_are_dropped() {
        let (_, queue) = queue();
        put(&queue, "a", OpType::Update, 3);
        assert_eq!(queue.drop_superseded(&task("a"), 2).unwrap(), 0);
        assert_eq!(queue.drop_superseded(&task("a"), 3).unwrap(), 1);
        assert!(queue.is_empty());
    }

    fn dirty(id: &str, local: u64, synced: u64, tombstone: bool) -> DirtyEntry {
        DirtyEntry {
            key: task(id),
            record: Some(EntityRecord {
                id: id.into(),
                table: Table::Tasks,
                tenant_id: TenantId::new("acme"),
                payload: if tombstone { Value::Null } else { json!({ "v": local }) },
                version: local,
                updated_at: 1,
                tombstone,
            }),
            versions: VersionRecord {
                local_version: local,
                synced_version: synced,
            },
        }
    }

    #[test]
    fn rebuild_fills_gaps_only() {
        let (_, queue) = queue();
        put(&queue, "queued", OpType::Update, 2);
        let parked = put(&queue, "parked", OpType::Update, 4);
        queue.dead_letter(parked, "rejected").unwrap();

        let mut lost = dirty("lost", 2, 1, false);
        lost.record = None;
        let report = queue
            .rebuild(&[
                dirty("queued", 2, 1, false),
                dirty("parked", 4, 1, false),
                dirty("new", 1, 0, false),
                dirty("edited", 3, 2, false),
                dirty("gone", 5, 4, true),
                lost,
            ])
            .unwrap();

        assert_eq!(
            report,
            RebuildReport {
                enqueued: 3,
                covered: 1,
                parked: 1,
                missing: 1
            }
        );
        let ops: Vec<(String, OpType)> = queue
            .items()
            .into_iter()
            .map(|item| (item.key.id, item.op_type))
            .collect();
        assert!(ops.contains(&("new".into(), OpType::Create)));
        assert!(ops.contains(&("edited".into(), OpType::Update)));
        assert!(ops.contains(&("gone".into(), OpType::Delete)));
    }

    proptest! {
        #[test]
        fn rebuild_leaves_no_dirty_entity_unqueued(
            entities in prop::collection::vec((0u64..4, 1u64..6, any::<bool>()), 1..20),
            queued in prop::collection::vec(any::<bool>(), 20),
        ) {
            let (_, queue) = queue();
            let mut entries = Vec::new();
            for (i, (synced, ahead, tombstone)) in entities.iter().enumerate() {
                let id = format!("e{i}");
                let entry = dirty(&id, synced + ahead, *synced, *tombstone);
                if queued[i] {
                    put(&queue, &id, OpType::Update, synced + ahead);
                }
                entries.push(entry);
            }
            queue.rebuild(&entries).unwrap();
            for entry in &entries {
                let items = queue.items_for(&entry.key);
                prop_assert!(items.iter().any(|item| item.version >= entry.versions.local_version));
            }
        }

        #[test]
        fn coalescing_keeps_one_item_with_the_latest_payload(versions in prop::collection::vec(1u64..50, 1..12)) {
            let (_, queue) = queue();
            for version in &versions {
                put(&queue, "a", OpType::Update, *version);
            }
            let items = queue.items();
            prop_assert_eq!(items.len(), 1);
            let newest = versions.iter().copied().max().unwrap();
            prop_assert_eq!(items[0].version, newest);
            prop_assert_eq!(items[0].payload.clone(), Some(json!({ "v": newest })));
        }
    }
}
