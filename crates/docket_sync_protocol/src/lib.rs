//! # Docket Sync Protocol
//!
//! Types exchanged between a device and the remote backend.
//!
//! This crate provides:
//! - [`OutboundOp`] and [`OpType`] for queued local changes, with the
//!   coalescing rules used when an entity is edited repeatedly offline
//! - [`PushAck`], [`RemoteRow`] and [`RemoteChange`] for what the remote
//!   sends back
//! - [`RemoteEvent`], the normalized input of reconciliation
//! - [`decide`], the pure reconciliation policy
//! - CBOR encoding of every message via [`WireMessage`]
//!
//! This is a pure protocol crate with no I/O operations. Tenants and
//! tables travel as strings; the engine maps them to its typed IDs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod messages;
mod operation;

pub use conflict::{decide, ConflictPolicy, Decision, LocalState, Winner};
pub use messages::{ChangeKind, PushAck, RemoteChange, RemoteEvent, RemoteRow, WireMessage};
pub use operation::{OpType, OutboundOp};
