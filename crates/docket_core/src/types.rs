//! Core type definitions for Docket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a tenant (a law firm or workspace).
///
/// Every entity, queue item and subscription belongs to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of the device (installation) that owns a local store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device ID from an existing value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random device ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the raw ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical tables of the case-management domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Clients of the firm.
    Clients,
    /// Legal cases.
    Cases,
    /// Tasks attached to cases.
    Tasks,
    /// Court hearings.
    Hearings,
    /// Case documents.
    Documents,
    /// External contacts.
    Contacts,
    /// Procedural deadlines.
    Deadlines,
    /// Free-form notes.
    Notes,
    /// Billable time entries.
    TimeEntries,
    /// Invoices.
    Invoices,
    /// Firm users.
    Users,
}

impl Table {
    /// Every table, in a stable order.
    pub const ALL: [Table; 11] = [
        Table::Clients,
        Table::Cases,
        Table::Tasks,
        Table::Hearings,
        Table::Documents,
        Table::Contacts,
        Table::Deadlines,
        Table::Notes,
        Table::TimeEntries,
        Table::Invoices,
        Table::Users,
    ];

    /// Returns the table's persisted name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Clients => "clients",
            Table::Cases => "cases",
            Table::Tasks => "tasks",
            Table::Hearings => "hearings",
            Table::Documents => "documents",
            Table::Contacts => "contacts",
            Table::Deadlines => "deadlines",
            Table::Notes => "notes",
            Table::TimeEntries => "time_entries",
            Table::Invoices => "invoices",
            Table::Users => "users",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown table: {s}"))
    }
}

/// Address of one entity within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// The table the entity lives in.
    pub table: Table,
    /// The entity ID, unique within the table.
    pub id: String,
}

impl EntityKey {
    /// Creates an entity key.
    pub fn new(table: Table, id: impl Into<String>) -> Self {
        Self {
            table,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Returns the current wall-clock time as Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
