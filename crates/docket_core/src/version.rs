//! Per-entity version bookkeeping and the dirty set.
//!
//! Each entity carries a [`VersionRecord`] with two counters: the latest
//! version known locally and the highest version the remote has
//! acknowledged. An entity is dirty iff the first exceeds the second.
//! Dirtiness is always recomputed from the two counters; the persisted
//! dirty index is only an accelerator and is repaired from version
//! records on open.

use crate::types::{EntityKey, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sync bookkeeping for one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Latest version known locally.
    pub local_version: u64,
    /// Highest version acknowledged by the remote.
    pub synced_version: u64,
}

impl VersionRecord {
    /// Returns true if the local version has not been acknowledged.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.local_version > self.synced_version
    }

    /// Returns the version the next local write will produce.
    #[must_use]
    pub const fn next_version(&self) -> u64 {
        self.local_version + 1
    }

    /// Returns this record with `synced_version` raised to `version`.
    ///
    /// Older or repeated acknowledgements leave the record unchanged.
    #[must_use]
    pub fn synced_to(mut self, version: u64) -> Self {
        if version >= self.synced_version {
            self.synced_version = version;
        }
        self
    }
}

/// In-memory version records of one tenant.
#[derive(Debug, Clone, Default)]
pub struct VersionTracker {
    records: BTreeMap<EntityKey, VersionRecord>,
}

impl VersionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of `key`, if any version was ever assigned.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<VersionRecord> {
        self.records.get(key).copied()
    }

    /// Returns the latest local version of `key` (0 if never written).
    #[must_use]
    pub fn local_version(&self, key: &EntityKey) -> u64 {
        self.get(key).map_or(0, |r| r.local_version)
    }

    /// Assigns the next version of `key` and returns it.
    ///
    /// The first call for a new entity returns 1.
    pub fn bump(&mut self, key: &EntityKey) -> u64 {
        let record = self.records.entry(key.clone()).or_default();
        record.local_version += 1;
        record.local_version
    }

    /// Records an acknowledgement of `version`.
    ///
    /// Monotonic: acknowledgements older than the current synced version
    /// are ignored. Returns the resulting record.
    pub fn mark_synced(&mut self, key: &EntityKey, version: u64) -> VersionRecord {
        let record = self.records.entry(key.clone()).or_default();
        *record = record.synced_to(version);
        *record
    }

    /// Replaces the record of `key`.
    pub fn set(&mut self, key: EntityKey, record: VersionRecord) {
        self.records.insert(key, record);
    }

    /// Returns true if `key` has unacknowledged local changes.
    #[must_use]
    pub fn is_dirty(&self, key: &EntityKey) -> bool {
        self.get(key).is_some_and(|r| r.is_dirty())
    }

    /// Lists dirty entities, optionally restricted to one table.
    #[must_use]
    pub fn list_dirty(&self, table: Option<Table>) -> Vec<EntityKey> {
        self.records
            .iter()
            .filter(|(k, r)| r.is_dirty() && table.map_or(true, |t| k.table == t))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Returns the number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over every record.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &VersionRecord)> {
        self.records.iter()
    }
}
