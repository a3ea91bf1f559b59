//! Change feed for observing committed writes.
//!
//! Every write, delete or applied remote change publishes one event after
//! it is durable. Cache and index layers outside the engine subscribe here
//! to invalidate whatever they derived from the store; the engine itself
//! does not know which caches exist.
//!
//! # Usage
//!
//! ```rust
//! use docket_core::{ChangeEvent, ChangeFeed, ChangeKind, ChangeOrigin, EntityKey, Table, TenantId};
//!
//! let feed = ChangeFeed::new();
//! let receiver = feed.subscribe();
//!
//! feed.publish(
//!     TenantId::new("acme"),
//!     EntityKey::new(Table::Tasks, "task-1"),
//!     ChangeKind::Insert,
//!     1,
//!     ChangeOrigin::Local,
//! );
//!
//! let event = receiver.try_recv().unwrap();
//! assert_eq!(event.sequence, 1);
//! ```

use crate::types::{EntityKey, TenantId};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entity was created (no previous version existed).
    Insert,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local write through the store API.
    Local,
    /// A remote change applied by reconciliation.
    Remote,
}

/// A single committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Feed-wide sequence number, starting at 1.
    pub sequence: u64,
    /// Tenant the entity belongs to.
    pub tenant: TenantId,
    /// The changed entity.
    pub key: EntityKey,
    /// Type of change.
    pub kind: ChangeKind,
    /// Version produced by the change.
    pub version: u64,
    /// Where the change came from.
    pub origin: ChangeOrigin,
}

/// Distributes committed changes to subscribers.
///
/// The feed:
/// - Emits only committed changes
/// - Preserves publish order
/// - Supports multiple subscribers
/// - Is thread-safe
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: Mutex<FeedHistory>,
    max_history: usize,
}

#[derive(Default)]
struct FeedHistory {
    next_sequence: u64,
    events: VecDeque<ChangeEvent>,
}

impl ChangeFeed {
    /// Creates a change feed keeping 1024 events of history.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(1024)
    }

    /// Creates a change feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: Mutex::new(FeedHistory {
                next_sequence: 1,
                events: VecDeque::new(),
            }),
            max_history,
        }
    }

    /// Subscribes to future events.
    ///
    /// The receiver should be drained regularly; events queue up until it
    /// is read or dropped.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes one change and returns its sequence number.
    pub fn publish(
        &self,
        tenant: TenantId,
        key: EntityKey,
        kind: ChangeKind,
        version: u64,
        origin: ChangeOrigin,
    ) -> u64 {
        let event = {
            let mut history = self.history.lock();
            let event = ChangeEvent {
                sequence: history.next_sequence,
                tenant,
                key,
                kind,
                version,
                origin,
            };
            history.next_sequence += 1;
            history.events.push_back(event.clone());
            while history.events.len() > self.max_history {
                history.events.pop_front();
            }
            event
        };

        let sequence = event.sequence;
        // Disconnected receivers are dropped here
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
        sequence
    }

    /// Returns events with sequence > `cursor`, up to `limit`.
    ///
    /// Useful for subscribers catching up after a gap.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .lock()
            .events
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest published sequence number (0 if none).
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.history.lock().next_sequence - 1
    }

    /// Returns the number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Table;
    use std::sync::Arc;
    use std::thread;

    fn publish(feed: &ChangeFeed, id: &str) -> u64 {
        feed.publish(
            TenantId::new("acme"),
            EntityKey::new(Table::Tasks, id),
            ChangeKind::Update,
            1,
            ChangeOrigin::Local,
        )
    }

    #[test]
    fn multiple_subscribers() {
        let feed = ChangeFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();
        publish(&feed, "a");
        assert_eq!(rx1.recv().unwrap().key.id, "a");
        assert_eq!(rx2.recv().unwrap().key.id, "a");
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        drop(rx);
        publish(&feed, "a");
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = ChangeFeed::new();
        for id in ["a", "b", "c"] {
            publish(&feed, id);
        }
        let events = feed.poll(1, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(feed.latest_sequence(), 3);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(2);
        for id in ["a", "b", "c"] {
            publish(&feed, id);
        }
        let events = feed.poll(0, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key.id, "b");
    }

    #[test]
    fn concurrent_publishers_get_unique_sequences() {
        let feed = Arc::new(ChangeFeed::new());
        let rx = feed.subscribe();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let feed = Arc::clone(&feed);
                thread::spawn(move || {
                    for i in 0..25 {
                        publish(&feed, &format!("{t}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut seqs: Vec<u64> = rx.try_iter().map(|e| e.sequence).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 100);
    }
}
