//! Store configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the store keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Everything is lost when the process exits.
    Memory,
    /// Data survives restarts.
    Durable,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Memory => f.write_str("memory"),
            StorageMode::Durable => f.write_str("durable"),
        }
    }
}

/// Configuration for a local store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Panic instead of returning `ScopeViolation`.
    ///
    /// Meant for development builds where a cross-tenant access is a bug
    /// that should stop the program.
    pub panic_on_scope_violation: bool,

    /// How many times `write` retries after losing a version race.
    pub write_retry_limit: u32,

    /// Number of change events kept for polling.
    pub change_feed_history: usize,

    /// Storage mode recorded in the storage-mode flag.
    pub storage_mode: StorageMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            panic_on_scope_violation: false,
            write_retry_limit: 16,
            change_feed_history: 1024,
            storage_mode: StorageMode::Durable,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether scope violations panic.
    #[must_use]
    pub const fn panic_on_scope_violation(mut self, value: bool) -> Self {
        self.panic_on_scope_violation = value;
        self
    }

    /// Sets the optimistic-write retry budget.
    #[must_use]
    pub const fn write_retry_limit(mut self, limit: u32) -> Self {
        self.write_retry_limit = limit;
        self
    }

    /// Sets the change feed history size.
    #[must_use]
    pub const fn change_feed_history(mut self, size: usize) -> Self {
        self.change_feed_history = size;
        self
    }

    /// Sets the storage mode.
    #[must_use]
    pub const fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }
}

/// The persistence configuration as written to the `config` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    /// On-disk format version.
    pub format_version: u16,
    /// Storage mode at the time of writing.
    pub storage_mode: StorageMode,
    /// Optimistic-write retry budget.
    pub write_retry_limit: u32,
    /// Change feed history size.
    pub change_feed_history: usize,
    /// When the record was written (Unix milliseconds).
    pub written_at: u64,
}

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

impl PersistedConfig {
    /// Captures `config` as of `now`.
    #[must_use]
    pub fn capture(config: &StoreConfig, now: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            storage_mode: config.storage_mode,
            write_retry_limit: config.write_retry_limit,
            change_feed_history: config.change_feed_history,
            written_at: now,
        }
    }
}
