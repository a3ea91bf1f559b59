//! Inspect command implementation.

use super::{format_timestamp, open_store};
use docket_codec::from_cbor;
use docket_core::migration::MigrationManager;
use docket_core::{concern_of, list_devices, list_tenants, DeviceMeta, Keyspace};
use docket_storage::KvBackend;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Storage directory.
    pub path: String,
    /// Log file size in bytes.
    pub log_bytes: u64,
    /// Approximate size of the live keys and values.
    pub live_bytes: u64,
    /// Number of live keys.
    pub key_count: usize,
    /// Per-device details.
    pub devices: Vec<DeviceReport>,
}

/// What one device has stored.
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    /// Device id.
    pub device: String,
    /// Recorded storage mode, if the store was ever opened.
    pub storage_mode: Option<String>,
    /// Highest applied migration.
    pub schema_version: u64,
    /// When the persistence configuration was last written.
    pub config_written_at: Option<u64>,
    /// Whether an application snapshot is stored.
    pub has_snapshot: bool,
    /// Per-tenant details.
    pub tenants: Vec<TenantReport>,
}

/// What one tenant has stored.
#[derive(Debug, Serialize)]
pub struct TenantReport {
    /// Tenant id.
    pub tenant: String,
    /// Key count per concern.
    pub keys: BTreeMap<String, usize>,
    /// Time of the last committed local change.
    pub last_saved: Option<u64>,
}

impl TenantReport {
    /// Returns the number of keys of `concern`.
    pub fn count(&self, concern: &str) -> usize {
        self.keys.get(concern).copied().unwrap_or(0)
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_store(path)?;
    let stats = backend.stats();

    let result = InspectResult {
        path: path.display().to_string(),
        log_bytes: stats.log_bytes,
        live_bytes: stats.live_bytes,
        key_count: stats.key_count,
        devices: describe_devices(backend.as_ref())?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Builds a report for every device in `backend`.
pub fn describe_devices(backend: &dyn KvBackend) -> Result<Vec<DeviceReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::new();
    for device in list_devices(backend)? {
        let keyspace = Keyspace::new(&device);
        let meta = DeviceMeta::new(backend, &keyspace);

        let mut tenants = Vec::new();
        for tenant in list_tenants(backend, &keyspace)? {
            let keys = keyspace.tenant(&tenant);
            let mut counts = BTreeMap::new();
            for (key, _) in backend.scan_prefix(keys.prefix())? {
                *counts.entry(concern_of(&key).to_string()).or_insert(0) += 1;
            }
            let last_saved = match backend.get(&keys.last_saved())? {
                Some(bytes) => Some(from_cbor::<u64>(&bytes)?),
                None => None,
            };
            tenants.push(TenantReport {
                tenant: tenant.to_string(),
                keys: counts,
                last_saved,
            });
        }

        reports.push(DeviceReport {
            device: device.to_string(),
            storage_mode: meta.storage_mode()?.map(|m| m.to_string()),
            schema_version: MigrationManager::current_version(backend, &keyspace)?,
            config_written_at: meta.persisted_config()?.map(|c| c.written_at),
            has_snapshot: meta.app_snapshot()?.is_some(),
            tenants,
        });
    }
    Ok(reports)
}

fn print_text_output(result: &InspectResult) {
    println!("Docket Store: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Log size:   {} bytes", result.log_bytes);
    println!("  Live data:  {} bytes", result.live_bytes);
    println!("  Keys:       {}", result.key_count);

    if result.devices.is_empty() {
        println!();
        println!("No device data.");
    }

    for device in &result.devices {
        println!();
        println!("Device {}:", device.device);
        println!(
            "  Storage mode:   {}",
            device.storage_mode.as_deref().unwrap_or("not recorded")
        );
        println!("  Schema version: {}", device.schema_version);
        if let Some(at) = device.config_written_at {
            println!("  Config written: {}", format_timestamp(at));
        }
        println!("  App snapshot:   {}", if device.has_snapshot { "yes" } else { "no" });

        for tenant in &device.tenants {
            println!();
            println!("  Tenant {}:", tenant.tenant);
            println!("    Entities:     {}", tenant.count("entities"));
            println!("    Dirty:        {}", tenant.count("dirty"));
            println!("    Queued:       {}", tenant.count("queue"));
            println!("    Dead letters: {}", tenant.count("dead_letter"));
            if let Some(at) = tenant.last_saved {
                println!("    Last saved:   {}", format_timestamp(at));
            }
            for (concern, count) in &tenant.keys {
                println!("    {concern:<14}{count} keys");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed;
    use super::*;
    use docket_core::{DeviceId, StoreConfig};
    use docket_storage::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn reports_each_tenant() {
        let backend = Arc::new(MemoryBackend::new());
        seed(backend.clone(), "acme", 3);
        seed(backend.clone(), "globex", 1);
        let keyspace = Keyspace::new(&DeviceId::new("dev1"));
        DeviceMeta::new(backend.as_ref(), &keyspace)
            .record_config(&StoreConfig::default(), 42)
            .unwrap();

        let devices = describe_devices(backend.as_ref()).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.storage_mode.as_deref(), Some("durable"));
        assert_eq!(device.config_written_at, Some(42));
        assert!(!device.has_snapshot);

        let acme = &device.tenants[0];
        assert_eq!(acme.tenant, "acme");
        assert_eq!(acme.count("entities"), 3);
        assert_eq!(acme.count("dirty"), 3);
        assert!(acme.last_saved.is_some());
        assert_eq!(device.tenants[1].count("entities"), 1);
    }

    #[test]
    fn empty_store_has_no_devices() {
        let backend = MemoryBackend::new();
        assert!(describe_devices(&backend).unwrap().is_empty());
    }
}
