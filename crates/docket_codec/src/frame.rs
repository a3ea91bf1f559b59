//! Length-prefixed, checksummed record framing.
//!
//! ```text
//! | body_len: u32 LE | crc32(body): u32 LE | body... |
//! ```
//!
//! A reader walking a buffer of frames gets one of three answers for the
//! next position: a complete frame, an incomplete frame (the buffer ends
//! mid-header or mid-body, which is what a torn append looks like), or a
//! checksum error.

use crate::crc::compute_crc32;
use crate::error::{CodecError, CodecResult};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest body a frame may declare (64 MiB).
const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Result of reading one frame from the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameStatus<'a> {
    /// A full, checksum-valid frame.
    Complete {
        /// The frame body.
        body: &'a [u8],
        /// Total bytes consumed, header included.
        consumed: usize,
    },
    /// The buffer ends before the frame does.
    Incomplete,
}

/// Wraps `body` in a frame header.
#[must_use]
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&compute_crc32(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Reads the frame at the start of `buf`.
///
/// # Errors
///
/// Returns [`CodecError::ChecksumMismatch`] if the body does not match its
/// checksum and [`CodecError::FrameTooLarge`] if the declared length is
/// implausible.
pub fn read_frame(buf: &[u8]) -> CodecResult<FrameStatus<'_>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(FrameStatus::Incomplete);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len > MAX_FRAME_BODY {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_BODY,
        });
    }

    let end = FRAME_HEADER_SIZE + len;
    if buf.len() < end {
        return Ok(FrameStatus::Incomplete);
    }

    let body = &buf[FRAME_HEADER_SIZE..end];
    let actual = compute_crc32(body);
    if actual != expected {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    Ok(FrameStatus::Complete {
        body,
        consumed: end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_then_read() {
        let framed = frame(b"hello");
        assert_eq!(framed.len(), FRAME_HEADER_SIZE + 5);

        match read_frame(&framed).unwrap() {
            FrameStatus::Complete { body, consumed } => {
                assert_eq!(body, b"hello");
                assert_eq!(consumed, framed.len());
            }
            FrameStatus::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn consecutive_frames() {
        let mut buf = frame(b"one");
        buf.extend(frame(b"two"));

        let FrameStatus::Complete { consumed, .. } = read_frame(&buf).unwrap() else {
            panic!("expected complete frame");
        };
        let FrameStatus::Complete { body, .. } = read_frame(&buf[consumed..]).unwrap() else {
            panic!("expected complete frame");
        };
        assert_eq!(body, b"two");
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let framed = frame(b"a longer body");
        assert_eq!(read_frame(&framed[..3]).unwrap(), FrameStatus::Incomplete);
        assert_eq!(
            read_frame(&framed[..framed.len() - 1]).unwrap(),
            FrameStatus::Incomplete
        );
    }

    #[test]
    fn corrupted_body_is_detected() {
        let mut framed = frame(b"payload");
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        assert!(matches!(
            read_frame(&framed),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = vec![0xff, 0xff, 0xff, 0x7f];
        buf.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            read_frame(&buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn any_prefix_of_a_frame_is_never_an_error(body in prop::collection::vec(any::<u8>(), 0..256), cut in 0usize..264) {
            let framed = frame(&body);
            let cut = cut.min(framed.len());
            let status = read_frame(&framed[..cut]).unwrap();
            if cut == framed.len() {
                let is_complete = matches!(status, FrameStatus::Complete { .. });
                prop_assert!(is_complete);
            } else {
                prop_assert_eq!(status, FrameStatus::Incomplete);
            }
        }
    }
}
