//! User-visible sync notices.

use docket_core::{EntityKey, Table, TenantId};
use docket_sync_protocol::Winner;
use tokio::sync::broadcast;

/// Something the user may need to know about.
///
/// Transient failures are retried silently and never produce a notice.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A push was refused or ran out of retries and was parked.
    DeadLettered {
        /// Tenant of the operation.
        tenant: TenantId,
        /// Parked operation.
        op_id: u64,
        /// Entity it would have changed.
        key: EntityKey,
        /// Why it was parked.
        reason: String,
    },
    /// Both sides changed an entity; one payload was kept.
    ConflictResolved {
        /// Tenant of the entity.
        tenant: TenantId,
        /// The entity.
        key: EntityKey,
        /// Whose payload survived.
        winner: Winner,
    },
    /// A subscription came back after a disconnect and was reconciled.
    BridgeReconnected {
        /// Tenant of the subscription.
        tenant: TenantId,
        /// Table of the subscription.
        table: Table,
    },
    /// Opening failed; emergency recovery is the way out.
    InitializationFailed {
        /// Failure reason.
        reason: String,
    },
}

/// Sending half of the notice channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotice>,
}

impl Notifier {
    /// Creates a notifier keeping up to `capacity` unread notices per
    /// receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to notices sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.tx.subscribe()
    }

    /// Sends a notice. Having no receivers is not an error.
    pub fn send(&self, notice: SyncNotice) {
        let _ = self.tx.send(notice);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
