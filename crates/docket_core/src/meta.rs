//! Device-level metadata: persistence configuration, storage mode,
//! application snapshot, and discovery of devices and tenants.

use crate::config::{PersistedConfig, StorageMode, StoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::keys::{device_of, Keyspace, ROOT};
use crate::types::{DeviceId, TenantId};
use docket_codec::{from_cbor, to_cbor};
use docket_storage::{KvBackend, WriteBatch};
use std::collections::BTreeSet;

/// Builds the batch that records `config` and its storage mode.
///
/// # Errors
///
/// Codec errors.
pub fn config_batch(keyspace: &Keyspace, config: &StoreConfig, now: u64) -> CoreResult<WriteBatch> {
    let mut batch = WriteBatch::new();
    batch
        .put(keyspace.config(), to_cbor(&PersistedConfig::capture(config, now))?)
        .put(keyspace.storage_mode(), to_cbor(&config.storage_mode)?);
    Ok(batch)
}

/// Lists every device with data in `backend`.
///
/// # Errors
///
/// Storage errors.
pub fn list_devices(backend: &dyn KvBackend) -> CoreResult<Vec<DeviceId>> {
    let devices: BTreeSet<DeviceId> = backend
        .scan_prefix(ROOT)?
        .iter()
        .filter_map(|(key, _)| device_of(key))
        .collect();
    Ok(devices.into_iter().collect())
}

/// Lists every tenant with data on the device.
///
/// # Errors
///
/// Storage errors.
pub fn list_tenants(backend: &dyn KvBackend, keyspace: &Keyspace) -> CoreResult<Vec<TenantId>> {
    let tenants: BTreeSet<TenantId> = backend
        .scan_prefix(&keyspace.tenants_prefix())?
        .iter()
        .filter_map(|(key, _)| keyspace.tenant_of(key))
        .collect();
    Ok(tenants.into_iter().collect())
}

/// Accessors for the device-scoped keys.
pub struct DeviceMeta<'a> {
    backend: &'a dyn KvBackend,
    keyspace: &'a Keyspace,
}

impl<'a> DeviceMeta<'a> {
    /// Creates accessors for one device.
    #[must_use]
    pub fn new(backend: &'a dyn KvBackend, keyspace: &'a Keyspace) -> Self {
        Self { backend, keyspace }
    }

    /// Writes the persistence configuration and storage-mode flag.
    ///
    /// # Errors
    ///
    /// Storage or codec errors.
    pub fn record_config(&self, config: &StoreConfig, now: u64) -> CoreResult<()> {
        self.backend.commit(config_batch(self.keyspace, config, now)?)?;
        Ok(())
    }

    /// Reads the persistence configuration.
    ///
    /// # Errors
    ///
    /// Storage errors, or `StorageCorruption` if it cannot be decoded.
    pub fn persisted_config(&self) -> CoreResult<Option<PersistedConfig>> {
        self.read(&self.keyspace.config())
    }

    /// Reads the storage-mode flag.
    ///
    /// # Errors
    ///
    /// Storage errors, or `StorageCorruption` if it cannot be decoded.
    pub fn storage_mode(&self) -> CoreResult<Option<StorageMode>> {
        self.read(&self.keyspace.storage_mode())
    }

    /// Stores the application snapshot, replacing any previous one.
    ///
    /// The snapshot is opaque to Docket; the application uses it to
    /// restore UI state.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn save_app_snapshot(&self, snapshot: Vec<u8>) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(self.keyspace.app_snapshot(), snapshot);
        self.backend.commit(batch)?;
        Ok(())
    }

    /// Returns the application snapshot, if one was saved.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn app_snapshot(&self) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.backend.get(&self.keyspace.app_snapshot())?)
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        self.backend
            .get(key)?
            .map(|bytes| {
                from_cbor(&bytes).map_err(|e| CoreError::corruption(format!("{key}: {e}")))
            })
            .transpose()
    }
}
