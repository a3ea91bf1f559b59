//! # Docket Sync Engine
//!
//! Background synchronization between the local store and the remote
//! database.
//!
//! This crate provides:
//! - A durable, coalescing push queue with dead letters ([`SyncQueue`])
//! - A bounded-concurrency worker with retry and backoff ([`SyncWorker`])
//! - Version-based conflict resolution ([`Reconciler`])
//! - Per-table realtime subscriptions with reconnect ([`RealtimeBridge`])
//! - The [`Engine`] facade: initialization, tenant sessions and
//!   emergency recovery
//!
//! ## Data flow
//!
//! 1. A local write commits to the store and marks the entity dirty
//! 2. The change is queued (coalesced per entity) and the worker woken
//! 3. The worker pushes it; on acknowledgement the entity's synced
//!    version advances
//! 4. Remote changes arrive through the bridge and are reconciled
//!    against local versions; the higher version wins
//!
//! ## Key Invariants
//!
//! - Local writes never wait on the network
//! - At most one push per entity is in flight, in version order
//! - A remote change never overwrites a newer unacknowledged local change
//! - Nothing is read or written before the engine is ready

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod config;
mod engine;
mod error;
mod notice;
mod queue;
mod reconcile;
mod remote;
mod worker;

pub use bridge::RealtimeBridge;
pub use config::{BridgeConfig, EngineConfig, RetryConfig, StorageLocation, WorkerConfig};
pub use engine::{CompanionCache, Engine, ExitProcess, ReopenInPlace, RestartHook};
pub use error::{SyncError, SyncResult};
pub use notice::{Notifier, SyncNotice};
pub use queue::{DeadLetter, QueueItem, RebuildReport, SyncQueue};
pub use reconcile::{PassReport, Reconciler};
pub use remote::{MockRemote, RemoteBackend, RemoteError};
pub use worker::{drain_once, DrainReport, SyncWorker, WorkerContext};
