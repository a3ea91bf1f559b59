//! Reconciliation policy.
//!
//! [`decide`] compares what the device knows about an entity with a
//! remote event and picks one of three outcomes:
//!
//! - **Stale**: `remote_version <= synced_version`. The remote has nothing
//!   the device has not already acknowledged, so the event is dropped
//!   (`KeepLocal`).
//! - **Conflict**: the entity is dirty and the remote moved past the last
//!   acknowledged version. Both sides changed; the [`ConflictPolicy`]
//!   names the winner.
//! - **Accept**: the entity is clean and the remote is ahead.
//!
//! The function is pure: identical inputs always give identical
//! decisions.

use crate::messages::RemoteEvent;
use serde::{Deserialize, Serialize};

/// What the device knows about an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalState {
    /// Latest local version.
    pub local_version: u64,
    /// Highest version acknowledged by the remote.
    pub synced_version: u64,
    /// When the local version was written (Unix milliseconds).
    pub updated_at: u64,
}

impl LocalState {
    /// Returns true if the local version has not been acknowledged.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.local_version > self.synced_version
    }
}

/// Which side's payload survives a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    /// The local payload.
    Local,
    /// The remote payload.
    Remote,
}

/// Outcome of reconciling one remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Install the remote state.
    AcceptRemote,
    /// Leave local state alone.
    KeepLocal,
    /// Both sides changed; the winner's payload is kept.
    Conflict(Winner),
}

/// How true conflicts are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// The later `updated_at` wins; the remote wins ties.
    #[default]
    LastWriterWins,
    /// The remote always wins.
    ServerWins,
    /// The device always wins.
    ClientWins,
}

impl ConflictPolicy {
    /// Picks the winner of a conflict.
    #[must_use]
    pub const fn winner(self, local_updated_at: u64, remote_updated_at: u64) -> Winner {
        match self {
            ConflictPolicy::ServerWins => Winner::Remote,
            ConflictPolicy::ClientWins => Winner::Local,
            ConflictPolicy::LastWriterWins => {
                if local_updated_at > remote_updated_at {
                    Winner::Local
                } else {
                    Winner::Remote
                }
            }
        }
    }
}

/// Decides what to do with `remote` given the local state.
///
/// `local` is `None` when the device has never seen the entity. A delete
/// of an entity the device never saw is dropped.
#[must_use]
pub fn decide(local: Option<LocalState>, remote: &RemoteEvent, policy: ConflictPolicy) -> Decision {
    let Some(local) = local else {
        return if remote.is_delete() {
            Decision::KeepLocal
        } else {
            Decision::AcceptRemote
        };
    };

    if remote.remote_version <= local.synced_version {
        return Decision::KeepLocal;
    }
    if local.is_dirty() {
        return Decision::Conflict(policy.winner(local.updated_at, remote.updated_at));
    }
    if remote.remote_version > local.local_version {
        Decision::AcceptRemote
    } else {
        Decision::KeepLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ChangeKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(version: u64, updated_at: u64) -> RemoteEvent {
        RemoteEvent {
            entity_id: "task-1".into(),
            table: "tasks".into(),
            tenant_id: "acme".into(),
            kind: ChangeKind::Update,
            remote_version: version,
            remote_payload: Some(json!("remote")),
            updated_at,
        }
    }

    fn local(local_version: u64, synced_version: u64, updated_at: u64) -> Option<LocalState> {
        Some(LocalState {
            local_version,
            synced_version,
            updated_at,
        })
    }

    #[test]
    fn clean_entity_accepts_newer_remote() {
        let decision = decide(local(3, 3, 100), &event(4, 50), ConflictPolicy::default());
        assert_eq!(decision, Decision::AcceptRemote);
    }

    #[test]
    fn dirty_entity_with_later_local_write_keeps_local() {
        let decision = decide(local(5, 3, 200), &event(4, 100), ConflictPolicy::default());
        assert_eq!(decision, Decision::Conflict(Winner::Local));
    }

    #[test]
    fn remote_wins_ties() {
        let decision = decide(local(5, 3, 100), &event(4, 100), ConflictPolicy::default());
        assert_eq!(decision, Decision::Conflict(Winner::Remote));
    }

    #[test]
    fn stale_events_are_dropped() {
        assert_eq!(decide(local(5, 3, 0), &event(3, 999), ConflictPolicy::default()), Decision::KeepLocal);
        assert_eq!(decide(local(3, 3, 0), &event(2, 999), ConflictPolicy::default()), Decision::KeepLocal);
    }

    #[test]
    fn unknown_entities() {
        assert_eq!(decide(None, &event(1, 0), ConflictPolicy::default()), Decision::AcceptRemote);
        let mut delete = event(2, 0);
        delete.kind = ChangeKind::Delete;
        delete.remote_payload = None;
        assert_eq!(decide(None, &delete, ConflictPolicy::default()), Decision::KeepLocal);
    }

    #[test]
    fn fixed_policies() {
        assert_eq!(
            decide(local(5, 3, 999), &event(4, 1), ConflictPolicy::ServerWins),
            Decision::Conflict(Winner::Remote)
        );
        assert_eq!(
            decide(local(5, 3, 1), &event(4, 999), ConflictPolicy::ClientWins),
            Decision::Conflict(Winner::Local)
        );
    }

    fn policy() -> impl Strategy<Value = ConflictPolicy> {
        prop_oneof![
            Just(ConflictPolicy::LastWriterWins),
            Just(ConflictPolicy::ServerWins),
            Just(ConflictPolicy::ClientWins),
        ]
    }

    proptest! {
        #[test]
        fn decisions_are_deterministic(
            synced in 0u64..20,
            ahead in 0u64..5,
            local_at in 0u64..1000,
            remote_version in 0u64..30,
            remote_at in 0u64..1000,
            policy in policy(),
        ) {
            let state = local(synced + ahead, synced, local_at);
            let remote = event(remote_version, remote_at);
            let first = decide(state, &remote, policy);
            let second = decide(state, &remote.clone(), policy);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn never_accepts_stale_versions(
            synced in 0u64..20,
            ahead in 0u64..5,
            remote_version in 0u64..30,
        ) {
            let state = local(synced + ahead, synced, 0);
            let decision = decide(state, &event(remote_version, 0), ConflictPolicy::default());
            if remote_version <= synced {
                prop_assert_eq!(decision, Decision::KeepLocal);
            }
            if decision == Decision::AcceptRemote {
                prop_assert!(remote_version > synced + ahead);
            }
        }
    }
}
