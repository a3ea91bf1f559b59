//! Verify command implementation.
//!
//! Reads the log without taking the directory lock, replays it into memory
//! and then checks that every stored value decodes as what its key says it
//! is, and that the dirty markers agree with the version records.

use docket_codec::from_cbor;
use docket_core::migration::AppliedMigration;
use docket_core::{concern_of, BackupManager, EntityRecord, PersistedConfig, StorageMode, VersionRecord, ROOT};
use docket_storage::{scan_log, KvBackend, MemoryBackend, LOG_FILE};
use docket_sync_engine::{DeadLetter, QueueItem};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Batches replayed from the log.
    pub batches: usize,
    /// Live keys after replay.
    pub keys_checked: usize,
    /// Whether the log ends in an unfinished append.
    pub torn_tail: bool,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {path:?}");
    println!();

    let log_path = path.join(LOG_FILE);
    if !log_path.exists() {
        return Err(super::CliError::NoStore(path.to_path_buf()).into());
    }

    let result = match scan_log(&log_path) {
        Ok(scan) => {
            let backend = MemoryBackend::new();
            for batch in &scan.batches {
                backend.commit(batch.clone())?;
            }
            let mut result = check_backend(&backend)?;
            result.batches = scan.batches.len();
            result.torn_tail = scan.torn_tail;
            result
        }
        Err(e) => VerifyResult {
            errors: vec![format!("log cannot be replayed: {e}")],
            ..VerifyResult::default()
        },
    };

    println!("  Batches: {}", result.batches);
    println!("  Keys checked: {}", result.keys_checked);
    if result.torn_tail {
        println!("  Torn tail: yes (dropped on next open)");
    }
    println!();

    if result.is_ok() {
        println!("Store verification PASSED");
        Ok(())
    } else {
        for error in result.errors.iter().take(20) {
            println!("  - {error}");
        }
        if result.errors.len() > 20 {
            println!("  ... and {} more", result.errors.len() - 20);
        }
        println!();
        println!("Store verification FAILED");
        Err("Verification failed".into())
    }
}

/// Checks every key under the root of `backend`.
pub fn check_backend(backend: &dyn KvBackend) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let entries = backend.scan_prefix(ROOT)?;
    result.keys_checked = entries.len();

    let mut dirty_versions = BTreeSet::new();
    let mut dirty_markers = BTreeSet::new();

    for (key, value) in &entries {
        let concern = concern_of(key);
        if let Err(e) = check_value(concern, value) {
            result.errors.push(format!("{key}: {e}"));
            continue;
        }
        match concern {
            "versions" => {
                if let Ok(record) = from_cbor::<VersionRecord>(value) {
                    if record.is_dirty() {
                        dirty_versions.extend(entity_ref(key));
                    }
                }
            }
            "dirty" => {
                dirty_markers.extend(entity_ref(key));
            }
            _ => {}
        }
    }

    for missing in dirty_versions.difference(&dirty_markers) {
        result.errors.push(format!("{missing}: dirty entity without a dirty marker"));
    }
    for stray in dirty_markers.difference(&dirty_versions) {
        result.errors.push(format!("{stray}: dirty marker for a clean entity"));
    }
    Ok(result)
}

/// Drops the concern segment from a `<tenant prefix><concern>/<table>/<id>` key.
fn entity_ref(key: &str) -> Option<String> {
    let mut parts = key.rsplitn(4, '/');
    let id = parts.next()?;
    let table = parts.next()?;
    let _concern = parts.next()?;
    let prefix = parts.next()?;
    Some(format!("{prefix}/{table}/{id}"))
}

fn check_value(concern: &str, value: &[u8]) -> Result<(), String> {
    match concern {
        "entities" => decode::<EntityRecord>(value),
        "versions" => decode::<VersionRecord>(value),
        "queue" => decode::<QueueItem>(value),
        "dead_letter" => decode::<DeadLetter>(value),
        "queue_seq" | "last_saved" => decode::<u64>(value),
        "config" => decode::<PersistedConfig>(value),
        "storage_mode" => decode::<StorageMode>(value),
        "migrations" => decode::<Vec<AppliedMigration>>(value),
        "backup" => {
            if BackupManager::with_defaults().verify(value) {
                Ok(())
            } else {
                Err("emergency backup fails its checksum".to_string())
            }
        }
        "dirty" if value.is_empty() => Ok(()),
        "dirty" => Err("dirty marker carries data".to_string()),
        "snapshot" => Ok(()),
        other => Err(format!("unexpected key ({other})")),
    }
}

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<(), String> {
    from_cbor::<T>(value).map(|_| ()).map_err(|e| e.to_string())
}
