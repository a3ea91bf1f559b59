//! # Docket Testkit
//!
//! Test utilities for Docket.
//!
//! This crate provides:
//! - Ready-to-use tenant stores over memory or a temporary directory
//! - Property-based test generators using proptest
//! - A backend wrapper that injects storage failures
//! - Crash simulation for the on-disk log
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docket_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         store.write(store.tenant(), Table::Cases, "case-1", json!({})).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faulty;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::{log_len, simulate_crash, CrashPoint};
pub use faulty::FaultyBackend;
pub use fixtures::*;
pub use generators::*;
