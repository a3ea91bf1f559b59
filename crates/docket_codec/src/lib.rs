//! # Docket Codec
//!
//! Encoding primitives shared by every Docket crate that touches bytes.
//!
//! This crate provides:
//! - CBOR encoding/decoding of any `serde` type ([`to_cbor`], [`from_cbor`])
//! - Length-prefixed, CRC32-checked record framing ([`frame`], [`read_frame`])
//!
//! Persisted records (entities, version records, queue items) and wire
//! messages are all CBOR. Framing is used by the durable log backend so a
//! torn write at the tail of a file can be told apart from corruption in
//! the middle of it.
//!
//! ## Usage
//!
//! ```
//! use docket_codec::{from_cbor, to_cbor};
//!
//! let bytes = to_cbor(&("task-1", 3u64)).unwrap();
//! let (id, version): (String, u64) = from_cbor(&bytes).unwrap();
//! assert_eq!(id, "task-1");
//! assert_eq!(version, 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod crc;
mod error;
mod frame;

pub use cbor::{from_cbor, to_cbor};
pub use crc::compute_crc32;
pub use error::{CodecError, CodecResult};
pub use frame::{frame, read_frame, FrameStatus, FRAME_HEADER_SIZE};
