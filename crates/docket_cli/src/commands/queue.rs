//! Sync queue commands.

use super::{format_timestamp, open_store, resolve_device, resolve_tenant, Scope};
use docket_core::Keyspace;
use docket_storage::KvBackend;
use docket_sync_engine::{DeadLetter, QueueItem, SyncQueue};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Queue listing for one tenant.
#[derive(Debug, Serialize)]
pub struct QueueReport {
    /// Device id.
    pub device: String,
    /// Tenant id.
    pub tenant: String,
    /// Pending operations in queue order.
    pub pending: Vec<QueueItem>,
    /// Abandoned operations.
    pub dead_letters: Vec<DeadLetter>,
}

fn open_queue(path: &Path, scope: &Scope) -> Result<(SyncQueue, String, String), Box<dyn std::error::Error>> {
    let backend: Arc<dyn KvBackend> = open_store(path)?;
    let device = resolve_device(backend.as_ref(), scope)?;
    let keyspace = Keyspace::new(&device);
    let tenant = resolve_tenant(backend.as_ref(), &keyspace, scope)?;
    let queue = SyncQueue::open(backend, keyspace.tenant(&tenant))?;
    Ok((queue, device.to_string(), tenant.to_string()))
}

/// Collects the queue contents.
pub fn report(queue: &SyncQueue, device: &str, tenant: &str) -> QueueReport {
    QueueReport {
        device: device.to_string(),
        tenant: tenant.to_string(),
        pending: queue.items(),
        dead_letters: queue.dead_letters(),
    }
}

/// Lists pending operations and dead letters.
pub fn list(path: &Path, scope: &Scope, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (queue, device, tenant) = open_queue(path, scope)?;
    let report = report(&queue, &device, &tenant);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Sync queue of tenant {} on device {}", report.tenant, report.device);
    println!();
    println!("Pending: {}", report.pending.len());
    for item in &report.pending {
        println!(
            "  #{:<6} {:<6} {} v{} (attempts {}, enqueued {})",
            item.op_id,
            item.op_type,
            item.key,
            item.version,
            item.attempts,
            format_timestamp(item.enqueued_at)
        );
        if let Some(error) = &item.last_error {
            println!("          last error: {error}");
        }
    }
    println!();
    println!("Dead letters: {}", report.dead_letters.len());
    for dead in &report.dead_letters {
        println!(
            "  #{:<6} {:<6} {} v{} ({})",
            dead.item.op_id, dead.item.op_type, dead.item.key, dead.item.version, dead.reason
        );
    }
    Ok(())
}

/// Moves a dead letter back into the queue.
pub fn requeue(path: &Path, scope: &Scope, op_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _, tenant) = open_queue(path, scope)?;
    let new_id = queue.requeue_dead_letter(op_id)?;
    info!(tenant = %tenant, op_id, new_id, "dead letter requeued");
    println!("Requeued #{op_id} as #{new_id}; it is pushed the next time the application syncs.");
    Ok(())
}

/// Drops a dead letter.
pub fn discard(path: &Path, scope: &Scope, op_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _, tenant) = open_queue(path, scope)?;
    let dead = queue.discard_dead_letter(op_id)?;
    info!(tenant = %tenant, op_id, "dead letter discarded");
    println!(
        "Discarded #{op_id} ({} v{}); the local change stays unsynced until it is edited again.",
        dead.item.key, dead.item.version
    );
    Ok(())
}
