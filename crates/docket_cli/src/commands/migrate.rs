//! Migration commands.

use super::{format_timestamp, open_store, resolve_device, Scope};
use docket_core::migration::{MigrationManager, MigrationRunResult};
use docket_core::{Keyspace, StorageMode, StoreConfig};
use docket_storage::KvBackend;
use std::path::Path;
use tracing::info;

/// Show current migration status.
pub fn status(path: &Path, scope: &Scope) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);
    info!(device = %device, "checking migration status");

    let applied = MigrationManager::applied(backend.as_ref(), &keyspace)?;
    let current = MigrationManager::current_version(backend.as_ref(), &keyspace)?;

    println!("Migration Status (device {device})");
    println!("================");
    println!("  Current version: {current}");
    println!("  Applied migrations: {}", applied.len());
    for migration in &applied {
        println!(
            "  v{}: {} (applied {})",
            migration.version,
            migration.name,
            format_timestamp(migration.applied_at)
        );
    }
    Ok(())
}

/// List all known migrations.
pub fn list(path: &Path, scope: &Scope) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);

    let manager = MigrationManager::with_builtin();
    let pending = manager.pending(backend.as_ref(), &keyspace)?;

    println!("Known Migrations");
    println!("================");
    for migration in manager.registered() {
        let state = if pending.iter().any(|p| p.version == migration.version) {
            "pending"
        } else {
            "applied"
        };
        println!("  v{}: {} [{state}]", migration.version, migration.name);
        if let Some(description) = &migration.description {
            println!("      {description}");
        }
    }
    Ok(())
}

/// Run pending migrations.
pub fn run(path: &Path, scope: &Scope, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);
    let manager = MigrationManager::with_builtin();

    if dry_run {
        let pending = manager.pending(backend.as_ref(), &keyspace)?;
        if pending.is_empty() {
            println!("Nothing to migrate.");
        }
        for migration in pending {
            println!("Would apply v{}: {}", migration.version, migration.name);
        }
        return Ok(());
    }

    let result = apply(&manager, backend.as_ref(), &keyspace)?;
    if result.applied.is_empty() {
        println!("Nothing to migrate (version {}).", result.final_version);
    } else {
        for migration in &result.applied {
            println!("Applied v{}: {}", migration.version, migration.name);
        }
        println!("Now at version {}.", result.final_version);
    }
    Ok(())
}

/// Runs `manager`'s pending migrations against a directory store.
pub fn apply(
    manager: &MigrationManager,
    backend: &dyn KvBackend,
    keyspace: &Keyspace,
) -> Result<MigrationRunResult, Box<dyn std::error::Error>> {
    let config = StoreConfig::new().storage_mode(StorageMode::Durable);
    Ok(manager.run_pending(backend, keyspace, &config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{DeviceId, DeviceMeta};
    use docket_storage::MemoryBackend;

    #[test]
    fn apply_runs_builtins_once() {
        let backend = MemoryBackend::new();
        let keyspace = Keyspace::new(&DeviceId::new("dev1"));
        let manager = MigrationManager::with_builtin();

        let first = apply(&manager, &backend, &keyspace).unwrap();
        assert_eq!(first.applied.len(), 2);
        assert_eq!(first.final_version, 2);
        assert_eq!(
            DeviceMeta::new(&backend, &keyspace).storage_mode().unwrap(),
            Some(StorageMode::Durable)
        );

        let second = apply(&manager, &backend, &keyspace).unwrap();
        assert!(second.applied.is_empty());
        assert!(manager.pending(&backend, &keyspace).unwrap().is_empty());
    }
}
