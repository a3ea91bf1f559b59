//! Property-based test generators using proptest.
//!
//! Strategies produce domain-valid data: known tables, short entity ids
//! drawn from a small pool (so generated operations collide on the same
//! entities), and JSON payloads shaped like case-management records.

use docket_core::Table;
use docket_sync_protocol::{ChangeKind, RemoteChange, RemoteRow};
use proptest::prelude::*;
use serde_json::{json, Value};

/// A local mutation, for driving stores and engines in property tests.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOp {
    /// Write a payload.
    Write {
        /// Target table.
        table: Table,
        /// Entity id.
        id: String,
        /// New payload.
        payload: Value,
    },
    /// Delete the entity if it exists.
    Delete {
        /// Target table.
        table: Table,
        /// Entity id.
        id: String,
    },
}

impl LocalOp {
    /// Returns the target table and id.
    pub fn target(&self) -> (Table, &str) {
        match self {
            LocalOp::Write { table, id, .. } | LocalOp::Delete { table, id } => (*table, id.as_str()),
        }
    }
}

/// Strategy for a table.
pub fn table_strategy() -> impl Strategy<Value = Table> {
    prop::sample::select(Table::ALL.to_vec())
}

/// Strategy for an entity id from a pool of `pool` ids.
pub fn entity_id_strategy(pool: usize) -> impl Strategy<Value = String> {
    (0..pool.max(1)).prop_map(|i| format!("e-{i}"))
}

/// Strategy for a record payload.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[A-Za-z ]{0,24}").expect("Invalid regex"),
        any::<u32>(),
        any::<bool>(),
        prop::option::of(prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")),
    )
        .prop_map(|(title, number, closed, owner)| {
            json!({
                "title": title,
                "number": number,
                "closed": closed,
                "owner": owner,
            })
        })
}

/// Strategy for one local mutation over a pool of `pool` entities per table.
pub fn local_op_strategy(pool: usize) -> impl Strategy<Value = LocalOp> {
    prop_oneof![
        3 => (table_strategy(), entity_id_strategy(pool), payload_strategy())
            .prop_map(|(table, id, payload)| LocalOp::Write { table, id, payload }),
        1 => (table_strategy(), entity_id_strategy(pool))
            .prop_map(|(table, id)| LocalOp::Delete { table, id }),
    ]
}

/// Strategy for a sequence of local mutations.
pub fn local_ops_strategy(pool: usize, max_len: usize) -> impl Strategy<Value = Vec<LocalOp>> {
    prop::collection::vec(local_op_strategy(pool), 1..=max_len.max(1))
}

/// Strategy for a remote row of `tenant` in `table`.
pub fn remote_row_strategy(tenant: &str, table: Table, pool: usize) -> impl Strategy<Value = RemoteRow> {
    let tenant = tenant.to_string();
    (entity_id_strategy(pool), 1..50u64, payload_strategy(), any::<bool>(), 0..1_000_000u64).prop_map(
        move |(id, version, payload, deleted, updated_at)| RemoteRow {
            id,
            table: table.as_str().to_string(),
            tenant_id: tenant.clone(),
            version,
            payload: if deleted { None } else { Some(payload) },
            updated_at,
            deleted,
        },
    )
}

/// Strategy for a remote change event.
pub fn remote_change_strategy(tenant: &str, table: Table, pool: usize) -> impl Strategy<Value = RemoteChange> {
    remote_row_strategy(tenant, table, pool).prop_map(|row| RemoteChange {
        kind: if row.deleted {
            ChangeKind::Delete
        } else if row.version == 1 {
            ChangeKind::Insert
        } else {
            ChangeKind::Update
        },
        row,
    })
}
