//! Remote backend abstraction.

use crate::error::SyncError;
use async_trait::async_trait;
use docket_sync_protocol::{OutboundOp, PushAck, RemoteChange, RemoteRow};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by a remote backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or backend failure; worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// The remote refuses the operation; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The remote holds a newer version than the one pushed.
    ///
    /// Retried: the realtime bridge delivers the newer version, and
    /// reconciliation moves the pending push above it.
    #[error("stale push: remote holds version {remote_version}")]
    Stale {
        /// Version the remote holds.
        remote_version: u64,
    },
}

impl RemoteError {
    /// Returns true if the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Rejected(_))
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected(message) => SyncError::RemoteRejected { message },
            other => SyncError::RemoteTransient {
                message: other.to_string(),
            },
        }
    }
}

/// The backend the engine syncs with.
///
/// This trait abstracts the network layer. Implementations must filter
/// change feeds by tenant; delivery may be unordered and at-least-once.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Pushes one local change.
    async fn push(&self, op: &OutboundOp) -> Result<PushAck, RemoteError>;

    /// Returns the authoritative state of one table, deleted rows included.
    async fn snapshot(&self, tenant: &str, table: &str) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Subscribes to changes of one table of one tenant.
    ///
    /// The subscription ends when the returned receiver yields `None`.
    async fn subscribe(
        &self,
        tenant: &str,
        table: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RemoteChange>, RemoteError>;
}

struct Subscriber {
    tenant: String,
    table: String,
    tx: mpsc::Sender<RemoteChange>,
}

/// A scriptable remote for testing.
///
/// Pushes are accepted unless an outcome was scripted with
/// [`MockRemote::script_push`]. Every push attempt is recorded.
#[derive(Default)]
pub struct MockRemote {
    offline: AtomicBool,
    script: Mutex<VecDeque<Result<(), RemoteError>>>,
    attempts: Mutex<Vec<OutboundOp>>,
    accepted: Mutex<Vec<OutboundOp>>,
    snapshots: Mutex<HashMap<(String, String), Vec<RemoteRow>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    push_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    /// Creates a new mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a transient error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queues the outcome of a future push.
    pub fn script_push(&self, outcome: Result<(), RemoteError>) {
        self.script.lock().push_back(outcome);
    }

    /// Sets the rows returned by `snapshot`.
    pub fn set_snapshot(&self, tenant: &str, table: &str, rows: Vec<RemoteRow>) {
        self.snapshots
            .lock()
            .insert((tenant.to_string(), table.to_string()), rows);
    }

    /// Delays every push, so concurrent pushes overlap.
    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock() = delay;
    }

    /// Delivers `change` to matching subscribers; returns how many got it.
    pub fn emit(&self, change: &RemoteChange) -> usize {
        let subscribers = self.subscribers.lock();
        subscribers
            .iter()
            .filter(|s| s.tenant == change.row.tenant_id && s.table == change.row.table)
            .filter(|s| s.tx.try_send(change.clone()).is_ok())
            .count()
    }

    /// Ends every open subscription.
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    /// Returns the number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Returns every push attempt, in arrival order.
    pub fn attempts(&self) -> Vec<OutboundOp> {
        self.attempts.lock().clone()
    }

    /// Returns every accepted push, in arrival order.
    pub fn accepted(&self) -> Vec<OutboundOp> {
        self.accepted.lock().clone()
    }

    /// Returns the most pushes observed in flight at once.
    pub fn max_concurrent_pushes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Transient("offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteBackend for MockRemote {
    async fn push(&self, op: &OutboundOp) -> Result<PushAck, RemoteError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.push_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.attempts.lock().push(op.clone());
        self.check_online()?;
        if let Some(outcome) = self.script.lock().pop_front() {
            outcome?;
        }
        self.accepted.lock().push(op.clone());
        Ok(PushAck {
            op_id: op.op_id,
            version: op.version,
        })
    }

    async fn snapshot(&self, tenant: &str, table: &str) -> Result<Vec<RemoteRow>, RemoteError> {
        self.check_online()?;
        Ok(self
            .snapshots
            .lock()
            .get(&(tenant.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        tenant: &str,
        table: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(Subscriber {
            tenant: tenant.to_string(),
            table: table.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_sync_protocol::{ChangeKind, OpType};
    use serde_json::json;

    fn op(op_id: u64) -> OutboundOp {
        OutboundOp {
            op_id,
            tenant_id: "acme".into(),
            table: "tasks".into(),
            entity_id: "task-1".into(),
            op_type: OpType::Create,
            payload: Some(json!({"title": "File motion"})),
            version: 1,
            updated_at: 0,
        }
    }

    fn row(tenant: &str) -> RemoteRow {
        RemoteRow {
            id: "task-1".into(),
            table: "tasks".into(),
            tenant_id: tenant.into(),
            version: 2,
            payload: Some(json!({})),
            updated_at: 0,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn scripted_push_outcomes() {
        let remote = MockRemote::new();
        remote.script_push(Err(RemoteError::Transient("timeout".into())));
        remote.script_push(Err(RemoteError::Rejected("invalid".into())));

        assert!(matches!(remote.push(&op(1)).await, Err(RemoteError::Transient(_))));
        assert!(matches!(remote.push(&op(1)).await, Err(RemoteError::Rejected(_))));
        let ack = remote.push(&op(1)).await.unwrap();
        assert_eq!(ack, PushAck { op_id: 1, version: 1 });
        assert_eq!(remote.attempts().len(), 3);
        assert_eq!(remote.accepted().len(), 1);
    }

    #[tokio::test]
    async fn offline_fails_transiently() {
        let remote = MockRemote::new();
        remote.set_offline(true);
        assert!(matches!(remote.push(&op(1)).await, Err(RemoteError::Transient(_))));
        assert!(remote.snapshot("acme", "tasks").await.is_err());
        assert!(remote.subscribe("acme", "tasks", 4).await.is_err());
    }

    #[tokio::test]
    async fn emit_respects_tenant_filter() {
        let remote = MockRemote::new();
        let mut acme = remote.subscribe("acme", "tasks", 4).await.unwrap();
        let _globex = remote.subscribe("globex", "tasks", 4).await.unwrap();

        let change = RemoteChange {
            kind: ChangeKind::Update,
            row: row("acme"),
        };
        assert_eq!(remote.emit(&change), 1);
        assert_eq!(acme.recv().await.unwrap(), change);

        remote.disconnect_subscribers();
        assert!(acme.recv().await.is_none());
    }

    #[test]
    fn error_mapping() {
        assert!(SyncError::from(RemoteError::Transient("x".into())).is_retryable());
        assert!(SyncError::from(RemoteError::Stale { remote_version: 3 }).is_retryable());
        assert!(matches!(
            SyncError::from(RemoteError::Rejected("x".into())),
            SyncError::RemoteRejected { .. }
        ));
        assert!(RemoteError::Stale { remote_version: 3 }.is_retryable());
    }
}
