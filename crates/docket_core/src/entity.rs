//! Entity records.

use crate::types::{EntityKey, Table, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of a logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity ID, unique within (tenant, table).
    pub id: String,
    /// Table the entity belongs to.
    pub table: Table,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The domain object. `Null` for tombstones.
    pub payload: Value,
    /// Version produced by the write that stored this record.
    pub version: u64,
    /// When that write happened (Unix milliseconds).
    pub updated_at: u64,
    /// Deleted locally; kept until the delete is acknowledged.
    pub tombstone: bool,
}

impl EntityRecord {
    /// Returns the key addressing this record.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.table, self.id.clone())
    }

    /// Returns true if the record is a live (non-deleted) entity.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.tombstone
    }
}
