//! Configuration for the sync engine.

use docket_core::{DeviceId, StoreConfig, Table, TenantId};
use docket_storage::{KvBackend, LogConfig};
use docket_sync_protocol::ConflictPolicy;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that never gives up.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` failures.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay before retry number `attempt` (0 means the
    /// first try, which is immediate).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // NaN and negative products collapse to zero
        let delay_secs = base_delay.max(0.0).min(self.max_delay.as_secs_f64());

        let total = if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top of the capped delay.
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        // Past what a Duration holds, the cap is the answer
        Duration::try_from_secs_f64(total).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Configuration of the queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pushes in flight at once, across distinct entities.
    pub max_concurrency: usize,
    /// How long the worker sleeps when nothing is due.
    pub idle_poll: Duration,
    /// How long `stop` waits for in-flight pushes.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    /// Creates the default worker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound. Zero is treated as one.
    #[must_use]
    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.max_concurrency = value.max(1);
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub const fn idle_poll(mut self, value: Duration) -> Self {
        self.idle_poll = value;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, value: Duration) -> Self {
        self.shutdown_grace = value;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            idle_poll: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Configuration of the realtime bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Tables to subscribe to.
    pub tables: Vec<Table>,
    /// Backoff between resubscription attempts.
    pub reconnect: RetryConfig,
    /// Capacity of each subscription's event channel.
    pub channel_capacity: usize,
}

impl BridgeConfig {
    /// Creates the default bridge configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the bridge to `tables`.
    #[must_use]
    pub fn tables(mut self, tables: impl IntoIterator<Item = Table>) -> Self {
        self.tables = tables.into_iter().collect();
        self
    }

    /// Sets the reconnect backoff.
    #[must_use]
    pub fn reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    /// Sets the channel capacity. Zero is treated as one.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tables: Table::ALL.to_vec(),
            reconnect: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            channel_capacity: 256,
        }
    }
}

/// Where the engine keeps its data.
#[derive(Clone, Default)]
pub enum StorageLocation {
    /// In memory; lost when the engine is dropped.
    #[default]
    Memory,
    /// A durable log in this directory.
    Directory(PathBuf),
    /// A backend supplied by the caller.
    Custom(Arc<dyn KvBackend>),
}

impl std::fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Memory => f.write_str("Memory"),
            StorageLocation::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            StorageLocation::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This device.
    pub device: DeviceId,
    /// Tenant whose session is opened first.
    pub tenant: TenantId,
    /// Where data lives.
    pub storage: StorageLocation,
    /// Local store settings.
    pub store: StoreConfig,
    /// Durable log settings, used with [`StorageLocation::Directory`].
    pub log: LogConfig,
    /// Push retry policy.
    pub retry: RetryConfig,
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Bridge settings.
    pub bridge: BridgeConfig,
    /// How true conflicts are resolved.
    pub conflict_policy: ConflictPolicy,
    /// Start the worker and bridge as soon as the engine is ready.
    pub autostart_sync: bool,
}

impl EngineConfig {
    /// Creates a configuration for `device` opening `tenant`.
    #[must_use]
    pub fn new(device: DeviceId, tenant: TenantId) -> Self {
        Self {
            device,
            tenant,
            storage: StorageLocation::Memory,
            store: StoreConfig::default(),
            log: LogConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            bridge: BridgeConfig::default(),
            conflict_policy: ConflictPolicy::default(),
            autostart_sync: true,
        }
    }

    /// Sets the storage location.
    #[must_use]
    pub fn storage(mut self, storage: StorageLocation) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the local store settings.
    #[must_use]
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the durable log settings.
    #[must_use]
    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Sets the push retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the worker settings.
    #[must_use]
    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the bridge settings.
    #[must_use]
    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Chooses whether sync starts automatically.
    #[must_use]
    pub fn autostart_sync(mut self, value: bool) -> Self {
        self.autostart_sync = value;
        self
    }
}
