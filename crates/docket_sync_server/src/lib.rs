//! # Docket Sync Server
//!
//! In-process reference remote for the Docket sync engine.
//!
//! This crate provides:
//! - Version-checked push handling with idempotent repeats
//! - Per-tenant, per-table row storage with tombstones
//! - Realtime change fan-out with lagging-subscriber disconnects
//! - Fault injection: offline mode, failing pushes, rejected entities
//!
//! # Protocol
//!
//! 1. A device subscribes to a table, then reads its snapshot
//! 2. The device pushes each local change with its entity version
//! 3. The server stores it if the version is newer and broadcasts it
//! 4. Older versions are refused as stale; the device reconciles the
//!    newer row it receives and pushes again above it

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod hub;
mod server;
mod tables;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use hub::Hub;
pub use server::SyncServer;
pub use tables::{PushOutcome, RemoteTables};
