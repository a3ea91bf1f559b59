//! Crash simulation for the log backend.
//!
//! Damages a closed storage directory the way an interrupted process or a
//! failing disk would, so tests can check what reopening does with it:
//!
//! - A torn tail (an append cut short) is truncated and the rest loads
//! - A damaged frame followed by more data is corruption and must fail
//!   the open, which is what drives emergency recovery

use docket_codec::{frame, FRAME_HEADER_SIZE};
use docket_storage::LOG_FILE;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Ways a storage directory can be damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The last append stopped partway through its frame.
    TornAppend,
    /// A byte inside the first frame's body flipped.
    CorruptFirstFrame,
    /// The log was cut to this many bytes.
    TruncateTo(u64),
}

/// Damages the log in `dir`. The backend must not be open.
///
/// # Errors
///
/// I/O errors reading or writing the log file.
pub fn simulate_crash(dir: &Path, point: CrashPoint) -> io::Result<()> {
    let path = dir.join(LOG_FILE);
    match point {
        CrashPoint::TornAppend => {
            let torn = frame(b"an append that never finished");
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&torn[..torn.len() / 2])?;
            file.sync_all()
        }
        CrashPoint::CorruptFirstFrame => {
            let mut data = std::fs::read(&path)?;
            let target = FRAME_HEADER_SIZE + 1;
            if data.len() <= target {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "log has no frame body to corrupt"));
            }
            data[target] ^= 0xff;
            std::fs::write(&path, data)
        }
        CrashPoint::TruncateTo(len) => {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(len)?;
            file.sync_all()
        }
    }
}

/// Returns the size of the log in `dir`.
///
/// # Errors
///
/// I/O errors reading the file's metadata.
pub fn log_len(dir: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(dir.join(LOG_FILE))?.len())
}
