//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding, decoding or unframing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A frame's checksum does not match its body.
    #[error("frame checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame header.
        expected: u32,
        /// Checksum computed over the body.
        actual: u32,
    },

    /// A frame declares a body larger than the allowed maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared body length.
        len: usize,
        /// Maximum accepted body length.
        max: usize,
    },
}

impl CodecError {
    /// Creates an encoding failed error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
