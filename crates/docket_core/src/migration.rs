//! Schema migrations.
//!
//! Migrations run while the initialization gate is `Opening`, before any
//! tenant store is loaded. Applied migrations are recorded in the
//! device's migration metadata; each migration's writes and its metadata
//! entry commit in one batch, so a crash leaves a migration either fully
//! applied and recorded or not applied at all.
//!
//! Migrations are:
//! - **Forward-only**: there is no rollback; emergency recovery is the
//!   way out of a store that cannot be migrated
//! - **Ordered**: pending migrations run in ascending version order
//! - **Device-wide**: a migration sees every tenant of the device
//!
//! ## Usage
//!
//! ```rust
//! use docket_core::migration::{Migration, MigrationContext, MigrationManager};
//! use docket_core::{CoreResult, DeviceId, Keyspace, StoreConfig};
//! use docket_storage::MemoryBackend;
//!
//! struct DropLegacySnapshot;
//!
//! impl Migration for DropLegacySnapshot {
//!     fn version(&self) -> u64 { 3 }
//!     fn name(&self) -> &str { "drop_legacy_snapshot" }
//!     fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
//!         let key = ctx.keyspace().app_snapshot();
//!         ctx.delete(key);
//!         Ok(())
//!     }
//! }
//!
//! let mut manager = MigrationManager::with_builtin();
//! manager.register(Box::new(DropLegacySnapshot)).unwrap();
//!
//! let backend = MemoryBackend::new();
//! let keyspace = Keyspace::new(&DeviceId::new("dev"));
//! let run = manager.run_pending(&backend, &keyspace, &StoreConfig::default()).unwrap();
//! assert_eq!(run.final_version, 3);
//! ```

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::keys::Keyspace;
use crate::meta::{config_batch, list_tenants};
use crate::types::{now_millis, TenantId};
use crate::version::VersionRecord;
use docket_codec::{from_cbor, to_cbor};
use docket_storage::{KvBackend, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info};

/// Version number for migrations.
pub type MigrationVersion = u64;

/// A migration recorded in migration metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Version number.
    pub version: MigrationVersion,
    /// Migration name.
    pub name: String,
    /// When the migration was applied (Unix milliseconds).
    pub applied_at: u64,
}

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Version number.
    pub version: MigrationVersion,
    /// Human-readable name.
    pub name: String,
    /// Description of what the migration does.
    pub description: Option<String>,
}

/// Result of running all pending migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationRunResult {
    /// Migrations applied by this run, in order.
    pub applied: Vec<AppliedMigration>,
    /// Schema version after the run.
    pub final_version: MigrationVersion,
}

/// Context handed to a running migration.
///
/// Reads go straight to the backend; writes accumulate in a batch that is
/// committed together with the migration's metadata entry.
pub struct MigrationContext<'a> {
    backend: &'a dyn KvBackend,
    keyspace: &'a Keyspace,
    config: &'a StoreConfig,
    batch: WriteBatch,
    notes: Vec<String>,
}

impl<'a> MigrationContext<'a> {
    fn new(backend: &'a dyn KvBackend, keyspace: &'a Keyspace, config: &'a StoreConfig) -> Self {
        Self {
            backend,
            keyspace,
            config,
            batch: WriteBatch::new(),
            notes: Vec::new(),
        }
    }

    /// The backend being migrated.
    #[must_use]
    pub fn backend(&self) -> &dyn KvBackend {
        self.backend
    }

    /// The device's keyspace.
    #[must_use]
    pub fn keyspace(&self) -> &Keyspace {
        self.keyspace
    }

    /// The configuration the store is opening with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        self.config
    }

    /// Lists the tenants that have data on this device.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn tenants(&self) -> CoreResult<Vec<TenantId>> {
        list_tenants(self.backend, self.keyspace)
    }

    /// Stages a put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.batch.put(key, value);
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.batch.delete(key);
    }

    /// Stages a prefix delete.
    pub fn delete_prefix(&mut self, prefix: impl Into<String>) {
        self.batch.delete_prefix(prefix);
    }

    /// Stages every operation of `batch`.
    pub fn stage(&mut self, batch: WriteBatch) {
        self.batch.extend(batch);
    }

    /// Records a note about what the migration did, for logging.
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }
}

/// A schema migration.
pub trait Migration: Send + Sync {
    /// Returns the version number of this migration.
    ///
    /// Versions must be unique; they need not be contiguous.
    fn version(&self) -> MigrationVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Returns an optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Stages the migration's writes.
    ///
    /// # Errors
    ///
    /// Any error aborts opening; nothing staged is committed.
    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()>;
}

/// Writes the persistence configuration and storage-mode flag.
#[derive(Debug, Default)]
pub struct RecordStorageConfig;

impl Migration for RecordStorageConfig {
    fn version(&self) -> MigrationVersion {
        1
    }

    fn name(&self) -> &str {
        "record_storage_config"
    }

    fn description(&self) -> Option<&str> {
        Some("write persistence configuration and storage-mode flag")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        let batch = config_batch(ctx.keyspace(), ctx.config(), now_millis())?;
        ctx.stage(batch);
        Ok(())
    }
}

/// Rebuilds every tenant's dirty index from its version records.
#[derive(Debug, Default)]
pub struct RebuildDirtyIndex;

impl Migration for RebuildDirtyIndex {
    fn version(&self) -> MigrationVersion {
        2
    }

    fn name(&self) -> &str {
        "rebuild_dirty_index"
    }

    fn description(&self) -> Option<&str> {
        Some("derive dirty markers from version records")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        for tenant in ctx.tenants()? {
            let keys = ctx.keyspace().tenant(&tenant);
            let mut markers = Vec::new();
            for (raw_key, bytes) in ctx.backend().scan_prefix(&keys.versions_prefix(None))? {
                let record: VersionRecord = from_cbor(&bytes)?;
                if record.is_dirty() {
                    let key = keys.parse_entity_key(&raw_key).ok_or_else(|| {
                        CoreError::migration_failed(format!("unrecognised key {raw_key}"))
                    })?;
                    markers.push(keys.dirty(&key));
                }
            }
            ctx.delete_prefix(keys.dirty_prefix(None));
            let count = markers.len();
            for marker in markers {
                ctx.put(marker, Vec::new());
            }
            ctx.note(format!("tenant {tenant}: {count} dirty entities"));
        }
        Ok(())
    }
}

/// Registers migrations and applies the pending ones.
pub struct MigrationManager {
    migrations: BTreeMap<MigrationVersion, Box<dyn Migration>>,
}

impl MigrationManager {
    /// Creates a manager with no migrations registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    /// Creates a manager with the built-in migrations registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut migrations: BTreeMap<MigrationVersion, Box<dyn Migration>> = BTreeMap::new();
        migrations.insert(1, Box::new(RecordStorageConfig));
        migrations.insert(2, Box::new(RebuildDirtyIndex));
        Self { migrations }
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the version is already taken.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(CoreError::invalid_operation(format!(
                "migration version {version} registered twice"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Lists registered migrations in version order.
    #[must_use]
    pub fn registered(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info_of(m.as_ref())).collect()
    }

    /// Reads the migration metadata of a device.
    ///
    /// # Errors
    ///
    /// Storage errors, or `StorageCorruption` if the metadata is unreadable.
    pub fn applied(backend: &dyn KvBackend, keyspace: &Keyspace) -> CoreResult<Vec<AppliedMigration>> {
        match backend.get(&keyspace.migrations())? {
            Some(bytes) => from_cbor(&bytes)
                .map_err(|e| CoreError::corruption(format!("migration metadata: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the highest applied version (0 if none).
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::applied`].
    pub fn current_version(backend: &dyn KvBackend, keyspace: &Keyspace) -> CoreResult<MigrationVersion> {
        Ok(Self::applied(backend, keyspace)?
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(0))
    }

    /// Lists registered migrations not yet applied.
    ///
    /// # Errors
    ///
    /// See [`MigrationManager::applied`].
    pub fn pending(&self, backend: &dyn KvBackend, keyspace: &Keyspace) -> CoreResult<Vec<MigrationInfo>> {
        let applied = Self::applied(backend, keyspace)?;
        Ok(self
            .migrations
            .values()
            .filter(|m| !applied.iter().any(|a| a.version == m.version()))
            .map(|m| info_of(m.as_ref()))
            .collect())
    }

    /// Applies every pending migration in version order.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` naming the first migration that failed.
    /// Migrations before it stay applied.
    pub fn run_pending(
        &self,
        backend: &dyn KvBackend,
        keyspace: &Keyspace,
        config: &StoreConfig,
    ) -> CoreResult<MigrationRunResult> {
        let mut recorded = Self::applied(backend, keyspace)?;
        let mut result = MigrationRunResult::default();

        for migration in self.migrations.values() {
            let version = migration.version();
            if recorded.iter().any(|a| a.version == version) {
                continue;
            }

            let mut ctx = MigrationContext::new(backend, keyspace, config);
            if let Err(e) = migration.up(&mut ctx) {
                error!(version, name = migration.name(), error = %e, "migration failed");
                return Err(CoreError::migration_failed(format!(
                    "{} (v{version}): {e}",
                    migration.name()
                )));
            }

            let entry = AppliedMigration {
                version,
                name: migration.name().to_string(),
                applied_at: now_millis(),
            };
            recorded.push(entry.clone());

            let MigrationContext { mut batch, notes, .. } = ctx;
            batch.put(keyspace.migrations(), to_cbor(&recorded)?);
            backend.commit(batch).map_err(|e| {
                CoreError::migration_failed(format!("{} (v{version}): {e}", migration.name()))
            })?;

            info!(version, name = migration.name(), notes = ?notes, "migration applied");
            result.applied.push(entry);
        }

        result.final_version = recorded.iter().map(|m| m.version).max().unwrap_or(0);
        Ok(result)
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn info_of(migration: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: migration.version(),
        name: migration.name().to_string(),
        description: migration.description().map(str::to_string),
    }
}
