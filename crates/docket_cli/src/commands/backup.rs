//! Backup and restore commands.
//!
//! A backup covers one tenant of one device: entities, version records,
//! dirty markers and, by default, the sync queue. Restoring replaces the
//! tenant's keys in a single batch, so an interrupted restore leaves the
//! old data in place.

use super::{format_timestamp, open_store, resolve_device, resolve_tenant, CliError, Scope};
use docket_core::{BackupManager, BackupMetadata, Keyspace};
use docket_storage::KvBackend;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Write a tenant backup to `output`.
pub fn create(path: &Path, scope: &Scope, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);
    let tenant = resolve_tenant(backend.as_ref(), &keyspace, scope)?;
    info!(device = %device, tenant = %tenant, "creating backup");

    let backup = BackupManager::with_defaults().create_backup(backend.as_ref(), &keyspace.tenant(&tenant))?;

    let mut file = fs::File::create(output)?;
    file.write_all(&backup.data)?;
    file.sync_all()?;

    println!("Backup created");
    println!("  Tenant: {tenant} (device {device})");
    println!("  Path: {output:?}");
    print_metadata(&backup.metadata);
    Ok(())
}

/// Replace a tenant's data with the backup in `input`.
pub fn restore(path: &Path, scope: &Scope, input: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    let manager = BackupManager::with_defaults();
    if !manager.verify(&data) {
        return Err("Backup file is invalid or corrupted".into());
    }

    let backend = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);
    let tenant = resolve_tenant(backend.as_ref(), &keyspace, scope)?;
    let keys = keyspace.tenant(&tenant);

    let existing = backend.scan_prefix(&keys.entities_prefix(None))?.len();
    if existing > 0 && !force {
        return Err(CliError::Refused(format!(
            "tenant {tenant} already holds {existing} entities; use --force to overwrite"
        ))
        .into());
    }

    info!(device = %device, tenant = %tenant, "restoring backup");
    let metadata = manager.restore_into(backend.as_ref(), &keys, &data)?;

    println!("Backup restored");
    println!("  Tenant: {tenant} (device {device})");
    print_metadata(&metadata);
    Ok(())
}

/// Check a backup file and show its metadata.
pub fn info(input: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    let restored = BackupManager::with_defaults().restore_from_backup(&data)?;

    println!("Backup is valid");
    print_metadata(&restored.metadata);
    Ok(())
}

fn print_metadata(metadata: &BackupMetadata) {
    println!("  Size: {} bytes", metadata.size);
    println!("  Entries: {}", metadata.entry_count);
    println!("  Created: {}", format_timestamp(metadata.timestamp));
}

#[cfg(test)]
mod tests {
    use super::super::test_support::seed;
    use super::*;
    use docket_storage::{KvBackend, LogBackend, LogConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_with(tenant: &str, cases: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn KvBackend> = Arc::new(LogBackend::open(dir.path(), LogConfig::default()).unwrap());
        seed(backend, tenant, cases);
        dir
    }

    #[test]
    fn backup_moves_a_tenant_between_stores() {
        let source = store_with("acme", 3);
        let target = store_with("acme", 0);
        let file = source.path().join("acme.bak");

        create(source.path(), &Scope::default(), &file).unwrap();
        info(&file).unwrap();

        let scope = Scope {
            device: Some("dev1".into()),
            tenant: Some("acme".into()),
        };
        restore(target.path(), &scope, &file, false).unwrap();

        let backend = open_store(target.path()).unwrap();
        let keys = Keyspace::new(&docket_core::DeviceId::new("dev1")).tenant(&docket_core::TenantId::new("acme"));
        assert_eq!(backend.scan_prefix(&keys.entities_prefix(None)).unwrap().len(), 3);
    }

    #[test]
    fn restore_refuses_to_overwrite_without_force() {
        let dir = store_with("acme", 2);
        let file = dir.path().join("acme.bak");
        create(dir.path(), &Scope::default(), &file).unwrap();

        let err = restore(dir.path(), &Scope::default(), &file, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        restore(dir.path(), &Scope::default(), &file, true).unwrap();
    }

    #[test]
    fn damaged_file_is_rejected() {
        let dir = store_with("acme", 1);
        let file = dir.path().join("acme.bak");
        create(dir.path(), &Scope::default(), &file).unwrap();

        let mut data = fs::read(&file).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&file, data).unwrap();

        assert!(info(&file).is_err());
        assert!(restore(dir.path(), &Scope::default(), &file, true).is_err());
    }
}
