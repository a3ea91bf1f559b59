//! Fan-out of row changes to subscribers.

use crate::error::{ServerError, ServerResult};
use docket_sync_protocol::RemoteChange;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

struct Subscriber {
    tenant: String,
    table: String,
    tx: mpsc::Sender<RemoteChange>,
}

/// Realtime subscriptions, one channel per subscriber.
///
/// A subscriber whose channel is full is disconnected instead of
/// blocking the writer; it resubscribes and catches up from a snapshot.
#[derive(Default)]
pub struct Hub {
    subscribers: Vec<Subscriber>,
}

impl Hub {
    /// Creates a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription to one table of one tenant.
    ///
    /// # Errors
    ///
    /// `TooManySubscribers` if `limit` live subscriptions exist.
    pub fn subscribe(
        &mut self,
        tenant: &str,
        table: &str,
        capacity: usize,
        limit: usize,
    ) -> ServerResult<mpsc::Receiver<RemoteChange>> {
        self.prune();
        if self.subscribers.len() >= limit {
            return Err(ServerError::TooManySubscribers { limit });
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(Subscriber {
            tenant: tenant.to_string(),
            table: table.to_string(),
            tx,
        });
        debug!(tenant, table, subscribers = self.subscribers.len(), "subscriber added");
        Ok(rx)
    }

    /// Delivers a change to the subscribers of its tenant and table.
    /// Returns how many received it.
    pub fn publish(&mut self, change: &RemoteChange) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|s| {
            if s.tenant != change.row.tenant_id || s.table != change.row.table {
                return !s.tx.is_closed();
            }
            match s.tx.try_send(change.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(tenant = %s.tenant, table = %s.table, "subscriber lagging, disconnected");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    /// Ends every subscription.
    pub fn disconnect_all(&mut self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        count
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&mut self) -> usize {
        self.prune();
        self.subscribers.len()
    }

    fn prune(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_sync_protocol::{ChangeKind, RemoteRow};

    fn change(tenant: &str, table: &str, version: u64) -> RemoteChange {
        RemoteChange {
            kind: ChangeKind::Update,
            row: RemoteRow {
                id: "x".into(),
                table: table.into(),
                tenant_id: tenant.into(),
                version,
                payload: None,
                updated_at: 0,
                deleted: false,
            },
        }
    }

    #[test]
    fn delivers_only_matching_changes() {
        let mut hub = Hub::new();
        let mut tasks = hub.subscribe("acme", "tasks", 8, 10).unwrap();
        let mut other = hub.subscribe("globex", "tasks", 8, 10).unwrap();

        assert_eq!(hub.publish(&change("acme", "tasks", 1)), 1);
        assert_eq!(hub.publish(&change("acme", "cases", 1)), 0);

        assert_eq!(tasks.try_recv().unwrap().row.version, 1);
        assert!(tasks.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn lagging_subscribers_are_dropped() {
        let mut hub = Hub::new();
        let mut rx = hub.subscribe("acme", "tasks", 1, 10).unwrap();
        hub.publish(&change("acme", "tasks", 1));
        hub.publish(&change("acme", "tasks", 2));

        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(rx.try_recv().unwrap().row.version, 1);
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn subscriber_limit() {
        let mut hub = Hub::new();
        let first = hub.subscribe("acme", "tasks", 1, 1).unwrap();
        assert!(matches!(
            hub.subscribe("acme", "cases", 1, 1),
            Err(ServerError::TooManySubscribers { limit: 1 })
        ));
        drop(first);
        assert!(hub.subscribe("acme", "cases", 1, 1).is_ok());
    }
}
