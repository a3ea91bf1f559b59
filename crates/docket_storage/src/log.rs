//! Durable append-only log backend.
//!
//! The backend owns a directory with this layout:
//!
//! ```text
//! <dir>/
//! ├─ LOCK            # Advisory lock for single-process access
//! ├─ data.log        # Framed CBOR write batches, oldest first
//! └─ data.log.tmp    # Only present while a compaction is in flight
//! ```
//!
//! Every committed [`WriteBatch`] is appended as one frame, so a batch is
//! either fully replayed on open or not at all. On open the log is replayed
//! into an in-memory ordered map that serves all reads.
//!
//! ## Recovery rules
//!
//! - A frame that runs past the end of the file is a torn append; the file
//!   is truncated back to the last complete frame.
//! - A checksum failure on the final frame is treated the same way.
//! - A checksum or decode failure followed by more data is corruption and
//!   fails the open.

use crate::backend::KvBackend;
use crate::batch::WriteBatch;
use crate::error::{StorageError, StorageResult};
use docket_codec::{frame, from_cbor, read_frame, to_cbor, CodecError, FrameStatus, FRAME_HEADER_SIZE};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the log file inside the backend directory.
pub const LOG_FILE: &str = "data.log";
const LOCK_FILE: &str = "LOCK";
const LOG_TEMP: &str = "data.log.tmp";

/// Configuration for the log backend.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Compact once the log is this many times larger than the live data.
    pub compact_ratio: u64,
    /// Never compact logs smaller than this many bytes.
    pub min_compact_bytes: u64,
    /// Whether to fsync after every commit (safer but slower).
    pub sync_on_commit: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            compact_ratio: 4,
            min_compact_bytes: 1024 * 1024, // 1 MB
            sync_on_commit: true,
        }
    }
}

impl LogConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compaction ratio.
    #[must_use]
    pub const fn compact_ratio(mut self, ratio: u64) -> Self {
        self.compact_ratio = ratio;
        self
    }

    /// Sets the minimum log size eligible for compaction.
    #[must_use]
    pub const fn min_compact_bytes(mut self, bytes: u64) -> Self {
        self.min_compact_bytes = bytes;
        self
    }

    /// Sets whether to fsync after every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

/// Size statistics for a log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// Bytes in the log file.
    pub log_bytes: u64,
    /// Approximate bytes of live keys and values.
    pub live_bytes: u64,
    /// Number of live keys.
    pub key_count: usize,
}

/// Result of scanning a log file without opening it as a backend.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Every decoded batch, oldest first.
    pub batches: Vec<WriteBatch>,
    /// Offset just past the last complete frame.
    pub valid_bytes: u64,
    /// Total bytes in the file.
    pub file_bytes: u64,
    /// Whether the file ends with a torn frame.
    pub torn_tail: bool,
}

/// Scans a log file and decodes every batch in it.
///
/// This does not take the directory lock and never modifies the file; it
/// is what offline verification tools use.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] when a damaged frame is followed by
/// more data, and an I/O error if the file cannot be read.
pub fn scan_log(path: &Path) -> StorageResult<LogScan> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(e) => return Err(e.into()),
    }
    scan_bytes(&data)
}

fn scan_bytes(data: &[u8]) -> StorageResult<LogScan> {
    let mut scan = LogScan {
        file_bytes: data.len() as u64,
        ..LogScan::default()
    };
    let mut offset = 0usize;

    while offset < data.len() {
        match read_frame(&data[offset..]) {
            Ok(FrameStatus::Complete { body, consumed }) => {
                let batch: WriteBatch = from_cbor(body).map_err(|e| {
                    StorageError::corrupted(format!("undecodable batch at offset {offset}: {e}"))
                })?;
                scan.batches.push(batch);
                offset += consumed;
            }
            Ok(FrameStatus::Incomplete) => {
                scan.torn_tail = true;
                break;
            }
            Err(CodecError::ChecksumMismatch { .. }) if frame_reaches_end(&data[offset..]) => {
                scan.torn_tail = true;
                break;
            }
            Err(e) => {
                return Err(StorageError::corrupted(format!(
                    "damaged frame at offset {offset}: {e}"
                )));
            }
        }
    }

    scan.valid_bytes = offset as u64;
    Ok(scan)
}

/// True if the frame starting at `buf` ends exactly at the end of `buf`.
fn frame_reaches_end(buf: &[u8]) -> bool {
    if buf.len() < FRAME_HEADER_SIZE {
        return true;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    FRAME_HEADER_SIZE + len >= buf.len()
}

struct LogInner {
    file: File,
    map: BTreeMap<String, Vec<u8>>,
    log_bytes: u64,
    live_bytes: u64,
}

/// A durable key/value backend backed by an append-only log.
///
/// # Thread Safety
///
/// The backend is `Send + Sync`; commits are serialized by an internal
/// mutex and only one process may open a directory at a time.
///
/// # Example
///
/// ```no_run
/// use docket_storage::{KvBackend, LogBackend, LogConfig, WriteBatch};
/// use std::path::Path;
///
/// let backend = LogBackend::open(Path::new("store"), LogConfig::default()).unwrap();
/// let mut batch = WriteBatch::new();
/// batch.put("key", b"value".to_vec());
/// backend.commit(batch).unwrap();
/// ```
pub struct LogBackend {
    dir: PathBuf,
    config: LogConfig,
    inner: Mutex<LogInner>,
    _lock_file: File,
}

impl std::fmt::Debug for LogBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBackend")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LogBackend {
    /// Opens or creates a log backend in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (`Locked`)
    /// - The log is corrupted beyond a torn tail (`Corrupted`)
    /// - I/O errors occur
    pub fn open(dir: &Path, config: LogConfig) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: dir.to_path_buf(),
            });
        }

        // A leftover temp file means a compaction died before its rename;
        // the original log is still authoritative.
        let temp = dir.join(LOG_TEMP);
        if temp.is_dir() {
            warn!(path = %temp.display(), "removing directory in place of compaction file");
            fs::remove_dir_all(&temp)?;
        } else if temp.exists() {
            warn!(path = %temp.display(), "removing abandoned compaction file");
            fs::remove_file(&temp)?;
        }

        let log_path = dir.join(LOG_FILE);
        let scan = scan_log(&log_path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        if scan.torn_tail {
            warn!(
                valid = scan.valid_bytes,
                total = scan.file_bytes,
                "truncating torn tail of storage log"
            );
            file.set_len(scan.valid_bytes)?;
            file.sync_all()?;
        }

        let mut map = BTreeMap::new();
        let mut live_bytes = 0u64;
        for batch in &scan.batches {
            live_bytes = live_bytes.saturating_add_signed(batch.apply_to(&mut map));
        }

        info!(
            dir = %dir.display(),
            batches = scan.batches.len(),
            keys = map.len(),
            "opened storage log"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            inner: Mutex::new(LogInner {
                file,
                map,
                log_bytes: scan.valid_bytes,
                live_bytes,
            }),
            _lock_file: lock_file,
        })
    }

    /// Deletes the log of a backend that is not open.
    ///
    /// Used when the log is too damaged to open and must be discarded.
    /// Takes the directory lock for the duration, so it fails with
    /// `Locked` if a backend is open on `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Locked` or I/O errors.
    pub fn destroy(dir: &Path) -> StorageResult<()> {
        if !dir.exists() {
            return Ok(());
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: dir.to_path_buf(),
            });
        }
        for name in [LOG_FILE, LOG_TEMP] {
            match fs::remove_file(dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        sync_directory(dir)?;
        warn!(dir = %dir.display(), "storage log destroyed");
        Ok(())
    }

    /// Returns the backend directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns current size statistics.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        LogStats {
            log_bytes: inner.log_bytes,
            live_bytes: inner.live_bytes,
            key_count: inner.map.len(),
        }
    }

    /// Rewrites the log so it holds exactly one batch of live keys.
    ///
    /// Uses write-then-rename for crash safety:
    /// 1. Write the live set to a temporary file
    /// 2. Sync the temporary file
    /// 3. Rename it over the log
    /// 4. Sync the directory so the rename is durable
    ///
    /// # Errors
    ///
    /// Returns an error if any file operation fails; the original log is
    /// untouched in that case.
    pub fn compact(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut LogInner) -> StorageResult<()> {
        let mut live = WriteBatch::new();
        for (key, value) in &inner.map {
            live.put(key.clone(), value.clone());
        }
        let framed = frame(&to_cbor(&live)?);

        let temp_path = self.dir.join(LOG_TEMP);
        let log_path = self.dir.join(LOG_FILE);
        {
            let mut temp = File::create(&temp_path)?;
            if !live.is_empty() {
                temp.write_all(&framed)?;
            }
            temp.sync_all()?;
        }
        // Open the replacement before the rename so a failure here leaves
        // the current handle pointing at the authoritative log.
        let file = OpenOptions::new().read(true).append(true).open(&temp_path)?;
        fs::rename(&temp_path, &log_path)?;

        inner.file = file;
        let before = inner.log_bytes;
        inner.log_bytes = if live.is_empty() { 0 } else { framed.len() as u64 };
        sync_directory(&self.dir)?;

        debug!(before, after = inner.log_bytes, "compacted storage log");
        Ok(())
    }

    fn should_compact(&self, inner: &LogInner) -> bool {
        inner.log_bytes >= self.config.min_compact_bytes
            && inner.log_bytes > self.config.compact_ratio.saturating_mul(inner.live_bytes.max(1))
    }
}

impl KvBackend for LogBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let framed = frame(&to_cbor(&batch)?);
        let mut inner = self.inner.lock();

        if let Err(e) = append_frame(&mut inner.file, &framed, self.config.sync_on_commit) {
            // Cut off whatever part of the frame reached the file so the log
            // never holds a batch the map does not.
            if let Err(truncate) = inner.file.set_len(inner.log_bytes) {
                warn!(error = %truncate, "failed to truncate storage log after a failed append");
            }
            return Err(e.into());
        }

        // Only mutate the map once the frame is on disk
        let delta = batch.apply_to(&mut inner.map);
        inner.log_bytes += framed.len() as u64;
        inner.live_bytes = inner.live_bytes.saturating_add_signed(delta);

        // The batch is durable from here on; compaction only reclaims space.
        if self.should_compact(&inner) {
            if let Err(e) = self.compact_locked(&mut inner) {
                warn!(error = %e, log_bytes = inner.log_bytes, "storage log compaction failed");
            }
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    fn key_count(&self) -> StorageResult<usize> {
        Ok(self.inner.lock().map.len())
    }
}

fn append_frame(file: &mut File, framed: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(framed)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StorageResult<()> {
    // NTFS journals metadata updates; directory fsync is not available
    Ok(())
}
