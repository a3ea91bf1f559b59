//! Row storage of the reference remote.

use crate::error::{ServerError, ServerResult};
use docket_sync_protocol::{ChangeKind, OpType, OutboundOp, RemoteChange, RemoteRow};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

type TableKey = (String, String);

/// Authoritative rows, per tenant and table.
///
/// Deleted rows stay as tombstones so versions never go backwards for an
/// entity that is recreated.
#[derive(Debug, Default)]
pub struct RemoteTables {
    tables: HashMap<TableKey, BTreeMap<String, RemoteRow>>,
}

/// What applying a push did.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The row moved to the pushed version.
    Applied(RemoteChange),
    /// The push repeated the stored row; nothing changed.
    Repeated,
}

impl RemoteTables {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a pushed operation if its version is newer than the stored
    /// row's.
    ///
    /// # Errors
    ///
    /// `Stale` if the stored row is at least as new, unless the push
    /// repeats it exactly and `idempotent` is set.
    pub fn apply_push(&mut self, op: &OutboundOp, idempotent: bool) -> ServerResult<PushOutcome> {
        let table = self.table_mut(&op.tenant_id, &op.table);
        let previous = table.get(&op.entity_id);

        if let Some(stored) = previous {
            if op.version <= stored.version {
                let repeat = op.version == stored.version
                    && stored.deleted == (op.op_type == OpType::Delete)
                    && (stored.deleted || stored.payload == op.payload);
                if idempotent && repeat {
                    return Ok(PushOutcome::Repeated);
                }
                return Err(ServerError::Stale {
                    current: stored.version,
                    pushed: op.version,
                });
            }
        }

        let kind = change_kind(previous, op.op_type == OpType::Delete);
        let row = RemoteRow::from_op(op, op.version, op.updated_at);
        table.insert(op.entity_id.clone(), row.clone());
        Ok(PushOutcome::Applied(RemoteChange { kind, row }))
    }

    /// Writes a row at the next version, as another device would.
    pub fn upsert(&mut self, tenant: &str, table: &str, id: &str, payload: Value, updated_at: u64) -> RemoteChange {
        let rows = self.table_mut(tenant, table);
        let previous = rows.get(id);
        let kind = change_kind(previous, false);
        let row = RemoteRow {
            id: id.to_string(),
            table: table.to_string(),
            tenant_id: tenant.to_string(),
            version: previous.map_or(1, |r| r.version + 1),
            payload: Some(payload),
            updated_at,
            deleted: false,
        };
        rows.insert(id.to_string(), row.clone());
        RemoteChange { kind, row }
    }

    /// Deletes a live row at the next version. Returns `None` if there is
    /// no live row.
    pub fn delete(&mut self, tenant: &str, table: &str, id: &str, updated_at: u64) -> Option<RemoteChange> {
        let rows = self.table_mut(tenant, table);
        let row = rows.get_mut(id).filter(|r| !r.deleted)?;
        row.version += 1;
        row.payload = None;
        row.deleted = true;
        row.updated_at = updated_at;
        Some(RemoteChange {
            kind: ChangeKind::Delete,
            row: row.clone(),
        })
    }

    /// Stores a row exactly as given, replacing any stored version.
    pub fn put_row(&mut self, row: RemoteRow) -> RemoteChange {
        let rows = self.table_mut(&row.tenant_id, &row.table);
        let kind = change_kind(rows.get(&row.id), row.deleted);
        rows.insert(row.id.clone(), row.clone());
        RemoteChange { kind, row }
    }

    /// Returns one row, tombstones included.
    pub fn row(&self, tenant: &str, table: &str, id: &str) -> Option<RemoteRow> {
        self.tables
            .get(&(tenant.to_string(), table.to_string()))
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Returns every row of a table in id order, tombstones included.
    pub fn snapshot(&self, tenant: &str, table: &str) -> Vec<RemoteRow> {
        self.tables
            .get(&(tenant.to_string(), table.to_string()))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of rows across all tables, tombstones included.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table_mut(&mut self, tenant: &str, table: &str) -> &mut BTreeMap<String, RemoteRow> {
        self.tables
            .entry((tenant.to_string(), table.to_string()))
            .or_default()
    }
}

fn change_kind(previous: Option<&RemoteRow>, deleted: bool) -> ChangeKind {
    match previous {
        _ if deleted => ChangeKind::Delete,
        Some(row) if !row.deleted => ChangeKind::Update,
        _ => ChangeKind::Insert,
    }
}
