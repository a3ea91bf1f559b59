//! # Docket Storage
//!
//! Key/value storage backends for Docket.
//!
//! This crate provides the lowest-level persistence abstraction. Backends
//! are **opaque key/value stores**: they map string keys to byte values,
//! support prefix scans, and apply a [`WriteBatch`] atomically. They know
//! nothing about tenants, entities, versions or queues; `docket_core` owns
//! the key namespace and every value format.
//!
//! ## Design Principles
//!
//! - A batch is all-or-nothing, both in memory and on disk
//! - Keys are ordered, so a concern stored under one prefix scans in order
//! - Backends must be `Send + Sync`; they are shared behind `Arc`
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - For tests and ephemeral sessions
//! - [`LogBackend`] - Durable append-only log in a locked directory
//!
//! ## Example
//!
//! ```rust
//! use docket_storage::{KvBackend, MemoryBackend, WriteBatch};
//!
//! let backend = MemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.put("docket/dev/t/acme/last_saved", vec![1]);
//! backend.commit(batch).unwrap();
//! assert_eq!(backend.get("docket/dev/t/acme/last_saved").unwrap(), Some(vec![1]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod error;
mod log;
mod memory;

pub use backend::KvBackend;
pub use batch::{BatchOp, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use log::{scan_log, LogBackend, LogConfig, LogScan, LogStats, LOG_FILE};
pub use memory::MemoryBackend;
