//! # Docket Core
//!
//! Local persistence for the Docket sync engine.
//!
//! This crate provides:
//! - The persisted key namespace ([`Keyspace`], [`TenantKeys`])
//! - Tenant-scoped entity storage with optimistic writes ([`LocalStore`])
//! - Per-entity version bookkeeping and the dirty set ([`VersionTracker`])
//! - A change feed for cache invalidation ([`ChangeFeed`])
//! - The initialization gate ([`InitGate`])
//! - Schema migrations, emergency backups and the recovery wipe
//!
//! Nothing here talks to the network; `docket_sync_engine` builds the sync
//! queue, reconciliation and realtime bridge on top of these pieces.
//!
//! ## Example
//!
//! ```rust
//! use docket_core::{ChangeFeed, DeviceId, InitGate, Keyspace, LocalStore, StoreConfig, Table, TenantId};
//! use docket_storage::MemoryBackend;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let tenant = TenantId::new("acme");
//! let gate = Arc::new(InitGate::new());
//! gate.begin_opening().unwrap();
//! let keys = Keyspace::new(&DeviceId::new("laptop")).tenant(&tenant);
//! let (store, _report) = LocalStore::load(
//!     Arc::new(MemoryBackend::new()),
//!     keys,
//!     Arc::clone(&gate),
//!     Arc::new(ChangeFeed::new()),
//!     StoreConfig::default(),
//! )
//! .unwrap();
//! gate.mark_ready().unwrap();
//!
//! let version = store.write(&tenant, Table::Tasks, "task-1", json!({"title": "Draft brief"})).unwrap();
//! assert_eq!(version, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
mod change_feed;
mod config;
mod entity;
mod error;
mod gate;
mod keys;
mod meta;
pub mod migration;
pub mod recovery;
mod store;
mod types;
mod version;

pub use backup::{BackupConfig, BackupManager, BackupMetadata};
pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeOrigin};
pub use config::{PersistedConfig, StorageMode, StoreConfig, FORMAT_VERSION};
pub use entity::EntityRecord;
pub use error::{CoreError, CoreResult};
pub use gate::{InitGate, Readiness};
pub use keys::{concern_of, escape, unescape, Keyspace, TenantKeys, ROOT};
pub use meta::{list_devices, list_tenants, DeviceMeta};
pub use migration::MigrationManager;
pub use store::{DirtyEntry, LoadReport, LocalStore, RemoteApply};
pub use types::{now_millis, DeviceId, EntityKey, Table, TenantId};
pub use version::{VersionRecord, VersionTracker};
