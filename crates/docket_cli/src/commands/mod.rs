//! CLI command implementations.

pub mod backup;
pub mod inspect;
pub mod migrate;
pub mod queue;
pub mod reset;
pub mod verify;

use docket_core::{list_devices, list_tenants, DeviceId, Keyspace, TenantId};
use docket_storage::{KvBackend, LogBackend, LogConfig, LOG_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Device and tenant selection from the global flags.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Requested device.
    pub device: Option<String>,
    /// Requested tenant.
    pub tenant: Option<String>,
}

/// Errors raised by the CLI itself, as opposed to the stores it opens.
#[derive(Debug, Error)]
pub enum CliError {
    /// Nothing has been stored at the path.
    #[error("no Docket store found at {0:?}")]
    NoStore(PathBuf),

    /// The store holds no data for any device.
    #[error("the store holds no device data")]
    NoDevice,

    /// Several devices are present and none was chosen.
    #[error("several devices present ({0}); pass --device")]
    AmbiguousDevice(String),

    /// The device has no tenant data.
    #[error("device {0} holds no tenant data; pass --tenant")]
    NoTenant(String),

    /// Several tenants are present and none was chosen.
    #[error("several tenants present ({0}); pass --tenant")]
    AmbiguousTenant(String),

    /// The command needs confirmation or would destroy data.
    #[error("{0}")]
    Refused(String),
}

/// Opens the log backend in `path`, refusing to create a new store.
pub fn open_store(path: &Path) -> Result<Arc<LogBackend>, Box<dyn std::error::Error>> {
    if !path.join(LOG_FILE).exists() {
        return Err(CliError::NoStore(path.to_path_buf()).into());
    }
    Ok(Arc::new(LogBackend::open(path, LogConfig::default())?))
}

/// Picks the device named in `scope`, or the only one present.
pub fn resolve_device(backend: &dyn KvBackend, scope: &Scope) -> Result<DeviceId, Box<dyn std::error::Error>> {
    if let Some(device) = &scope.device {
        return Ok(DeviceId::new(device.clone()));
    }
    let devices = list_devices(backend)?;
    match devices.as_slice() {
        [] => Err(CliError::NoDevice.into()),
        [only] => Ok(only.clone()),
        many => Err(CliError::AmbiguousDevice(join(many)).into()),
    }
}

/// Picks the tenant named in `scope`, or the only one the device has.
pub fn resolve_tenant(
    backend: &dyn KvBackend,
    keyspace: &Keyspace,
    scope: &Scope,
) -> Result<TenantId, Box<dyn std::error::Error>> {
    if let Some(tenant) = &scope.tenant {
        return Ok(TenantId::new(tenant.clone()));
    }
    let tenants = list_tenants(backend, keyspace)?;
    match tenants.as_slice() {
        [] => Err(CliError::NoTenant(keyspace.device().to_string()).into()),
        [only] => Ok(only.clone()),
        many => Err(CliError::AmbiguousTenant(join(many)).into()),
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Formats a millisecond timestamp as seconds since the epoch.
pub fn format_timestamp(ms: u64) -> String {
    format!("{}.{:03}s since epoch", ms / 1000, ms % 1000)
}
