//! The reference remote.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::hub::Hub;
use crate::tables::{PushOutcome, RemoteTables};
use docket_sync_protocol::{OpType, OutboundOp, PushAck, RemoteChange, RemoteRow, WireMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An in-process remote database with realtime subscriptions.
///
/// Stands in for the hosted backend in tests, benchmarks and the CLI's
/// offline tooling. Pushes are accepted when they carry a newer version
/// than the stored row; every accepted change is broadcast to the
/// subscribers of its tenant and table, including the pushing device's.
///
/// The `upsert_remote`/`delete_remote` methods act as another device
/// writing directly to the remote.
///
/// # Example
///
/// ```
/// use docket_sync_server::{ServerConfig, SyncServer};
/// use serde_json::json;
///
/// let server = SyncServer::new(ServerConfig::default());
/// let version = server.upsert_remote("acme", "cases", "case-1", json!({"number": "2024-001"}));
/// assert_eq!(version, 1);
/// assert_eq!(server.snapshot("acme", "cases").unwrap().len(), 1);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    tables: Mutex<RemoteTables>,
    hub: Mutex<Hub>,
    push_log: Mutex<Vec<OutboundOp>>,
    rejected: Mutex<HashSet<(String, String, String)>>,
    offline: AtomicBool,
    failures_left: AtomicU32,
}

impl SyncServer {
    /// Creates an empty remote.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(RemoteTables::new()),
            hub: Mutex::new(Hub::new()),
            push_log: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
        }
    }

    /// Handles a pushed local change.
    ///
    /// # Errors
    ///
    /// `Unavailable` while offline or failing, `Rejected` for refused
    /// entities and oversized payloads, `InvalidRequest` for malformed
    /// operations, `Stale` if the remote holds the same or a newer version.
    pub fn handle_push(&self, op: &OutboundOp) -> ServerResult<PushAck> {
        self.check_available()?;
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServerError::Unavailable("injected failure".into()));
        }
        self.validate(op)?;

        let mut tables = self.tables.lock();
        let outcome = tables.apply_push(op, self.config.idempotent_repeats).inspect_err(|e| {
            debug!(tenant = %op.tenant_id, table = %op.table, entity = %op.entity_id, error = %e, "push refused");
        })?;
        self.push_log.lock().push(op.clone());

        match outcome {
            PushOutcome::Applied(change) => {
                // Published under the table lock so subscribers see one
                // entity's versions in order.
                let delivered = self.hub.lock().publish(&change);
                debug!(
                    tenant = %op.tenant_id,
                    table = %op.table,
                    entity = %op.entity_id,
                    version = op.version,
                    op = %op.op_type,
                    delivered,
                    "push applied"
                );
            }
            PushOutcome::Repeated => {
                debug!(entity = %op.entity_id, version = op.version, "repeated push acknowledged");
            }
        }

        Ok(PushAck {
            op_id: op.op_id,
            version: op.version,
        })
    }

    /// Handles a CBOR-encoded [`OutboundOp`] and returns the encoded
    /// [`PushAck`].
    ///
    /// # Errors
    ///
    /// `Codec` for undecodable input, plus the errors of
    /// [`SyncServer::handle_push`].
    pub fn handle_message(&self, bytes: &[u8]) -> ServerResult<Vec<u8>> {
        let op = OutboundOp::decode(bytes)?;
        let ack = self.handle_push(&op)?;
        Ok(ack.encode()?)
    }

    /// Returns every row of a table, tombstones included.
    ///
    /// # Errors
    ///
    /// `Unavailable` while offline.
    pub fn snapshot(&self, tenant: &str, table: &str) -> ServerResult<Vec<RemoteRow>> {
        self.check_available()?;
        Ok(self.tables.lock().snapshot(tenant, table))
    }

    /// Subscribes to the changes of one table of one tenant.
    ///
    /// # Errors
    ///
    /// `Unavailable` while offline, `TooManySubscribers` at the limit.
    pub fn subscribe(&self, tenant: &str, table: &str, capacity: usize) -> ServerResult<mpsc::Receiver<RemoteChange>> {
        self.check_available()?;
        self.hub
            .lock()
            .subscribe(tenant, table, capacity, self.config.max_subscribers)
    }

    /// Writes a row at its next version as another device would, and
    /// broadcasts it. Returns the new version.
    pub fn upsert_remote(&self, tenant: &str, table: &str, id: &str, payload: Value) -> u64 {
        let mut tables = self.tables.lock();
        let change = tables.upsert(tenant, table, id, payload, now_millis());
        self.hub.lock().publish(&change);
        change.row.version
    }

    /// Deletes a row as another device would, and broadcasts it. Returns
    /// the tombstone's version, or `None` if there was no live row.
    pub fn delete_remote(&self, tenant: &str, table: &str, id: &str) -> Option<u64> {
        let mut tables = self.tables.lock();
        let change = tables.delete(tenant, table, id, now_millis())?;
        self.hub.lock().publish(&change);
        Some(change.row.version)
    }

    /// Stores a row exactly as given and broadcasts it.
    pub fn put_row(&self, row: RemoteRow) {
        let mut tables = self.tables.lock();
        let change = tables.put_row(row);
        self.hub.lock().publish(&change);
    }

    /// Returns one stored row.
    pub fn row(&self, tenant: &str, table: &str, id: &str) -> Option<RemoteRow> {
        self.tables.lock().row(tenant, table, id)
    }

    /// Returns every push that reached storage, accepted or repeated, in
    /// arrival order.
    pub fn push_log(&self) -> Vec<OutboundOp> {
        self.push_log.lock().clone()
    }

    /// Returns the number of stored rows, tombstones included.
    pub fn row_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.hub.lock().subscriber_count()
    }

    /// Ends every subscription, as a dropped connection would.
    pub fn disconnect_all(&self) {
        let dropped = self.hub.lock().disconnect_all();
        info!(dropped, "all subscribers disconnected");
    }

    /// Takes the remote offline or back online. Going offline ends every
    /// subscription.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.disconnect_all();
        }
        info!(offline, "remote availability changed");
    }

    /// Fails the next `count` pushes with `Unavailable`.
    pub fn fail_next_pushes(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Rejects every push for one entity.
    pub fn reject_entity(&self, tenant: &str, table: &str, id: &str) {
        self.rejected
            .lock()
            .insert((tenant.to_string(), table.to_string(), id.to_string()));
    }

    fn check_available(&self) -> ServerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ServerError::Unavailable("offline".into()))
        } else {
            Ok(())
        }
    }

    fn validate(&self, op: &OutboundOp) -> ServerResult<()> {
        if op.tenant_id.is_empty() || op.table.is_empty() || op.entity_id.is_empty() {
            return Err(ServerError::InvalidRequest("tenant, table and entity id are required".into()));
        }
        if op.version == 0 {
            return Err(ServerError::InvalidRequest("version must be positive".into()));
        }
        if op.op_type != OpType::Delete && op.payload.is_none() {
            return Err(ServerError::InvalidRequest(format!("{} without payload", op.op_type)));
        }
        let key = (op.tenant_id.clone(), op.table.clone(), op.entity_id.clone());
        if self.rejected.lock().contains(&key) {
            warn!(tenant = %op.tenant_id, table = %op.table, entity = %op.entity_id, "push rejected by policy");
            return Err(ServerError::Rejected(format!("entity {} is read-only", op.entity_id)));
        }
        if let Some(payload) = &op.payload {
            let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(usize::MAX);
            if size > self.config.max_payload_bytes {
                return Err(ServerError::Rejected(format!(
                    "payload of {size} bytes exceeds {} bytes",
                    self.config.max_payload_bytes
                )));
            }
        }
        Ok(())
    }
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_sync_protocol::ChangeKind;
    use serde_json::json;

    fn op(id: &str, op_type: OpType, version: u64, payload: Option<Value>) -> OutboundOp {
        OutboundOp {
            op_id: version,
            tenant_id: "acme".into(),
            table: "cases".into(),
            entity_id: id.into(),
            op_type,
            payload,
            version,
            updated_at: 42,
        }
    }

    #[test]
    fn push_then_snapshot() {
        let server = SyncServer::default();
        let ack = server
            .handle_push(&op("c1", OpType::Create, 1, Some(json!({"n": 1}))))
            .unwrap();
        assert_eq!(ack, PushAck { op_id: 1, version: 1 });

        let rows = server.snapshot("acme", "cases").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].updated_at, 42);
        assert_eq!(server.push_log().len(), 1);
    }

    #[tokio::test]
    async fn accepted_pushes_are_broadcast() {
        let server = SyncServer::default();
        let mut rx = server.subscribe("acme", "cases", 8).unwrap();

        server.handle_push(&op("c1", OpType::Create, 1, Some(json!({})))).unwrap();
        server.handle_push(&op("c1", OpType::Delete, 2, None)).unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Insert);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.kind, ChangeKind::Delete);
        assert!(deleted.row.deleted);
    }

    #[test]
    fn injected_failures_run_out() {
        let server = SyncServer::default();
        server.fail_next_pushes(2);
        let push = op("c1", OpType::Create, 1, Some(json!({})));

        assert!(matches!(server.handle_push(&push), Err(ServerError::Unavailable(_))));
        assert!(matches!(server.handle_push(&push), Err(ServerError::Unavailable(_))));
        assert!(server.handle_push(&push).is_ok());
    }

    #[test]
    fn offline_refuses_everything_and_drops_subscribers() {
        let server = SyncServer::default();
        let _rx = server.subscribe("acme", "cases", 8).unwrap();
        server.set_offline(true);

        assert_eq!(server.subscriber_count(), 0);
        assert!(server.snapshot("acme", "cases").is_err());
        assert!(server.subscribe("acme", "cases", 8).is_err());
        assert!(server
            .handle_push(&op("c1", OpType::Create, 1, Some(json!({}))))
            .unwrap_err()
            .is_retryable());
    }

    #[test]
    fn policy_rejections() {
        let server = SyncServer::new(ServerConfig::new().with_max_payload_bytes(16));
        server.reject_entity("acme", "cases", "locked");

        let err = server
            .handle_push(&op("locked", OpType::Update, 1, Some(json!({}))))
            .unwrap_err();
        assert!(matches!(err, ServerError::Rejected(_)));

        let big = json!({ "notes": "x".repeat(64) });
        let err = server.handle_push(&op("c1", OpType::Create, 1, Some(big))).unwrap_err();
        assert!(matches!(err, ServerError::Rejected(_)));
        assert!(server.push_log().is_empty());
    }

    #[test]
    fn malformed_pushes() {
        let server = SyncServer::default();
        assert!(matches!(
            server.handle_push(&op("", OpType::Create, 1, Some(json!({})))),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(matches!(
            server.handle_push(&op("c1", OpType::Update, 1, None)),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(matches!(
            server.handle_push(&op("c1", OpType::Create, 0, Some(json!({})))),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn other_device_writes_bump_versions() {
        let server = SyncServer::default();
        assert_eq!(server.upsert_remote("acme", "cases", "c1", json!({"n": 1})), 1);
        assert_eq!(server.upsert_remote("acme", "cases", "c1", json!({"n": 2})), 2);
        assert_eq!(server.delete_remote("acme", "cases", "c1"), Some(3));
        assert_eq!(server.delete_remote("acme", "cases", "c1"), None);
        assert!(server.row("acme", "cases", "c1").unwrap().deleted);
    }

    #[test]
    fn wire_round_trip() {
        let server = SyncServer::default();
        let bytes = op("c1", OpType::Create, 1, Some(json!({"n": 1}))).encode().unwrap();
        let ack = PushAck::decode(&server.handle_message(&bytes).unwrap()).unwrap();
        assert_eq!(ack.version, 1);
        assert!(matches!(server.handle_message(&[0xff]), Err(ServerError::Codec(_))));
    }
}
