//! Messages received from the remote, and their CBOR encoding.

use crate::operation::{OpType, OutboundOp};
use docket_codec::{from_cbor, to_cbor, CodecResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CBOR encoding shared by every protocol message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes to CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// The remote's acknowledgement of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// The acknowledged operation.
    pub op_id: u64,
    /// Version the remote now holds for the entity.
    pub version: u64,
}

/// One row as the remote stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Entity ID.
    pub id: String,
    /// Table name.
    pub table: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Authoritative version.
    pub version: u64,
    /// Payload; `None` once deleted.
    pub payload: Option<Value>,
    /// When the remote last changed the row (Unix milliseconds).
    pub updated_at: u64,
    /// Whether the row is deleted.
    pub deleted: bool,
}

/// Kind of change in the remote change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// One notification from the remote change feed.
///
/// Delivery is at-least-once and unordered; a change may be stale by the
/// time it arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// What happened.
    pub kind: ChangeKind,
    /// The row after the change.
    pub row: RemoteRow,
}

/// A remote change normalized for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Entity ID.
    pub entity_id: String,
    /// Table name.
    pub table: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// What happened.
    pub kind: ChangeKind,
    /// Version the remote holds.
    pub remote_version: u64,
    /// Payload the remote holds; `None` for deletes.
    pub remote_payload: Option<Value>,
    /// When the remote made the change (Unix milliseconds).
    pub updated_at: u64,
}

impl RemoteEvent {
    /// Builds an event from a change-feed notification.
    #[must_use]
    pub fn from_change(change: RemoteChange) -> Self {
        let kind = if change.row.deleted {
            ChangeKind::Delete
        } else {
            change.kind
        };
        Self::build(change.row, kind)
    }

    /// Builds an event from a snapshot row during a reconciliation pass.
    #[must_use]
    pub fn from_row(row: RemoteRow) -> Self {
        let kind = if row.deleted {
            ChangeKind::Delete
        } else {
            ChangeKind::Update
        };
        Self::build(row, kind)
    }

    /// Returns true if the remote no longer holds the entity.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    fn build(row: RemoteRow, kind: ChangeKind) -> Self {
        Self {
            remote_payload: if kind == ChangeKind::Delete { None } else { row.payload },
            entity_id: row.id,
            table: row.table,
            tenant_id: row.tenant_id,
            kind,
            remote_version: row.version,
            updated_at: row.updated_at,
        }
    }
}

impl RemoteRow {
    /// Builds the row an accepted push leaves on the remote.
    #[must_use]
    pub fn from_op(op: &OutboundOp, version: u64, updated_at: u64) -> Self {
        let deleted = op.op_type == OpType::Delete;
        Self {
            id: op.entity_id.clone(),
            table: op.table.clone(),
            tenant_id: op.tenant_id.clone(),
            version,
            payload: if deleted { None } else { op.payload.clone() },
            updated_at,
            deleted,
        }
    }
}

impl WireMessage for OutboundOp {}
impl WireMessage for PushAck {}
impl WireMessage for RemoteRow {}
impl WireMessage for RemoteChange {}
impl WireMessage for RemoteEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(deleted: bool) -> RemoteRow {
        RemoteRow {
            id: "task-1".into(),
            table: "tasks".into(),
            tenant_id: "acme".into(),
            version: 4,
            payload: Some(json!({"title": "x"})),
            updated_at: 10,
            deleted,
        }
    }

    #[test]
    fn deleted_rows_become_delete_events() {
        let event = RemoteEvent::from_change(RemoteChange {
            kind: ChangeKind::Update,
            row: row(true),
        });
        assert!(event.is_delete());
        assert_eq!(event.remote_payload, None);
        assert_eq!(event.remote_version, 4);
    }

    #[test]
    fn snapshot_rows_become_updates() {
        let event = RemoteEvent::from_row(row(false));
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.remote_payload, Some(json!({"title": "x"})));
    }

    #[test]
    fn change_wire_format() {
        let change = RemoteChange {
            kind: ChangeKind::Insert,
            row: row(false),
        };
        let decoded = RemoteChange::decode(&change.encode().unwrap()).unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(PushAck::decode(&[0xff, 0x01]).is_err());
    }
}
