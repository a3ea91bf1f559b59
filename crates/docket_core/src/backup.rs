//! Emergency backup snapshots.
//!
//! A backup captures every key of one tenant (entities, version records,
//! dirty index, sync queue, dead letters) as a self-checking blob. It is
//! stored under the tenant's `backup` key and can be exported through the
//! CLI before an emergency reset.
//!
//! ## Backup Format
//!
//! ```text
//! | magic (4) | version (2) | timestamp (8) | entry_count (4) | body_len (4) | body | crc32 (4) |
//! ```
//!
//! The body is the CBOR encoding of `(key suffix, value)` pairs, where the
//! suffix is relative to the tenant prefix so a backup restores into the
//! tenant it was taken from. The checksum covers everything before it.

use crate::error::{CoreError, CoreResult};
use crate::keys::TenantKeys;
use crate::types::now_millis;
use docket_codec::{compute_crc32, from_cbor, to_cbor};
use docket_storage::{KvBackend, WriteBatch};
use tracing::info;

/// Magic bytes for backup blobs.
const BACKUP_MAGIC: [u8; 4] = *b"DKBK";
/// Current backup format version.
const BACKUP_VERSION: u16 = 1;
/// Header size (magic + version + timestamp + entry_count + body_len).
const HEADER_SIZE: usize = 4 + 2 + 8 + 4 + 4;
/// Footer size (checksum).
const FOOTER_SIZE: usize = 4;

/// Configuration for backup operations.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Whether to include the sync queue and dead letters.
    pub include_queue: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { include_queue: true }
    }
}

/// Metadata about a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    /// When the backup was created (Unix milliseconds).
    pub timestamp: u64,
    /// Number of key/value entries.
    pub entry_count: u32,
    /// Size of the backup blob in bytes.
    pub size: usize,
}

/// Result of a backup operation.
#[derive(Debug)]
pub struct BackupResult {
    /// Backup metadata.
    pub metadata: BackupMetadata,
    /// The backup blob.
    pub data: Vec<u8>,
}

/// Result of decoding a backup.
#[derive(Debug)]
pub struct RestoreResult {
    /// Backup metadata.
    pub metadata: BackupMetadata,
    /// Entries keyed by suffix relative to the tenant prefix.
    pub entries: Vec<(String, Vec<u8>)>,
}

/// Creates, verifies and restores tenant backups.
pub struct BackupManager {
    config: BackupConfig,
}

impl BackupManager {
    /// Creates a backup manager with the given configuration.
    #[must_use]
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Creates a backup manager with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BackupConfig::default())
    }

    /// Captures every key of the tenant.
    ///
    /// The tenant's own `backup` key is never included.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn create_backup(&self, backend: &dyn KvBackend, keys: &TenantKeys) -> CoreResult<BackupResult> {
        let backup_key = keys.backup();
        let skipped = [keys.queue_prefix(), keys.queue_seq(), keys.dead_letter_prefix()];

        let entries: Vec<(String, Vec<u8>)> = backend
            .scan_prefix(keys.prefix())?
            .into_iter()
            .filter(|(k, _)| *k != backup_key)
            .filter(|(k, _)| self.config.include_queue || !skipped.iter().any(|p| k.starts_with(p.as_str())))
            .map(|(k, v)| (k[keys.prefix().len()..].to_string(), v))
            .collect();

        let timestamp = now_millis();
        let data = serialize_backup(&entries, timestamp)?;
        let metadata = BackupMetadata {
            timestamp,
            entry_count: entries.len() as u32,
            size: data.len(),
        };
        Ok(BackupResult { metadata, data })
    }

    /// Captures the tenant and stores the blob under its `backup` key.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn save_emergency_backup(&self, backend: &dyn KvBackend, keys: &TenantKeys) -> CoreResult<BackupMetadata> {
        let result = self.create_backup(backend, keys)?;
        let mut batch = WriteBatch::new();
        batch.put(keys.backup(), result.data);
        backend.commit(batch)?;
        info!(tenant = %keys.tenant(), entries = result.metadata.entry_count, "emergency backup saved");
        Ok(result.metadata)
    }

    /// Returns the stored emergency backup blob, if any.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn load_emergency_backup(backend: &dyn KvBackend, keys: &TenantKeys) -> CoreResult<Option<Vec<u8>>> {
        Ok(backend.get(&keys.backup())?)
    }

    /// Decodes and verifies a backup blob.
    ///
    /// # Errors
    ///
    /// Returns `StorageCorruption` on a bad magic, unknown version,
    /// truncation or checksum mismatch.
    pub fn restore_from_backup(&self, data: &[u8]) -> CoreResult<RestoreResult> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(CoreError::corruption("backup too small"));
        }
        if data[0..4] != BACKUP_MAGIC {
            return Err(CoreError::corruption("not a backup (bad magic)"));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != BACKUP_VERSION {
            return Err(CoreError::corruption(format!("unsupported backup version {version}")));
        }

        let timestamp = u64::from_le_bytes(array_8(&data[6..14]));
        let entry_count = u32::from_le_bytes(array_4(&data[14..18]));
        let body_len = u32::from_le_bytes(array_4(&data[18..22])) as usize;

        let expected_len = HEADER_SIZE + body_len + FOOTER_SIZE;
        if data.len() != expected_len {
            return Err(CoreError::corruption(format!(
                "backup length {} does not match header ({expected_len})",
                data.len()
            )));
        }

        let checksum_offset = HEADER_SIZE + body_len;
        let stored = u32::from_le_bytes(array_4(&data[checksum_offset..]));
        let computed = compute_crc32(&data[..checksum_offset]);
        if stored != computed {
            return Err(CoreError::corruption(format!(
                "backup checksum mismatch: expected {stored:08x}, got {computed:08x}"
            )));
        }

        let entries: Vec<(String, Vec<u8>)> = from_cbor(&data[HEADER_SIZE..checksum_offset])
            .map_err(|e| CoreError::corruption(format!("backup body: {e}")))?;
        if entries.len() != entry_count as usize {
            return Err(CoreError::corruption("backup entry count mismatch"));
        }

        Ok(RestoreResult {
            metadata: BackupMetadata {
                timestamp,
                entry_count,
                size: data.len(),
            },
            entries,
        })
    }

    /// Replaces the tenant's data with the contents of a backup.
    ///
    /// The blob itself is kept as the tenant's emergency backup. Must not
    /// run while a store for the tenant is open.
    ///
    /// # Errors
    ///
    /// Errors of [`BackupManager::restore_from_backup`], plus storage
    /// errors. Nothing is written if the blob does not verify.
    pub fn restore_into(&self, backend: &dyn KvBackend, keys: &TenantKeys, data: &[u8]) -> CoreResult<BackupMetadata> {
        let restored = self.restore_from_backup(data)?;
        let mut batch = WriteBatch::new();
        batch.delete_prefix(keys.prefix());
        for (suffix, value) in restored.entries {
            batch.put(format!("{}{suffix}", keys.prefix()), value);
        }
        batch.put(keys.backup(), data.to_vec());
        backend.commit(batch)?;
        info!(tenant = %keys.tenant(), entries = restored.metadata.entry_count, "backup restored");
        Ok(restored.metadata)
    }

    /// Checks a backup blob without decoding its entries into a store.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.restore_from_backup(data).is_ok()
    }
}

fn serialize_backup(entries: &[(String, Vec<u8>)], timestamp: u64) -> CoreResult<Vec<u8>> {
    let body = to_cbor(entries)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
    out.extend_from_slice(&BACKUP_MAGIC);
    out.extend_from_slice(&BACKUP_VERSION.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    let checksum = compute_crc32(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

#[inline]
fn array_8(slice: &[u8]) -> [u8; 8] {
    [slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7]]
}

#[inline]
fn array_4(slice: &[u8]) -> [u8; 4] {
    [slice[0], slice[1], slice[2], slice[3]]
}
