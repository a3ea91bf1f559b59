//! Outbound operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// The remote has never seen the entity.
    Create,
    /// The remote holds an older version of the entity.
    Update,
    /// The entity was deleted locally.
    Delete,
}

impl OpType {
    /// Combines a pending operation with a later one for the same entity.
    ///
    /// | pending | later | result |
    /// |---|---|---|
    /// | Create | Update | Create |
    /// | any | Delete | Delete |
    /// | Delete | Create or Update | Update |
    /// | Update | Create or Update | Update |
    /// | Create | Create | Create |
    ///
    /// A create followed by a delete still pushes the delete: the remote
    /// may have been sent the create in an earlier session.
    #[must_use]
    pub const fn coalesce(self, later: OpType) -> OpType {
        match (self, later) {
            (_, OpType::Delete) => OpType::Delete,
            (OpType::Create, _) => OpType::Create,
            (OpType::Update | OpType::Delete, _) => OpType::Update,
        }
    }

    /// Returns the operation's wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local change being pushed to the remote.
///
/// `payload` is the snapshot taken when the change was queued; it is never
/// re-read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundOp {
    /// Queue-assigned operation ID.
    pub op_id: u64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Table name.
    pub table: String,
    /// Entity ID.
    pub entity_id: String,
    /// Operation type.
    pub op_type: OpType,
    /// Payload snapshot; `None` for deletes.
    pub payload: Option<Value>,
    /// Local version the snapshot corresponds to.
    pub version: u64,
    /// When the local change was made (Unix milliseconds).
    pub updated_at: u64,
}
