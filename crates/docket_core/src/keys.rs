//! The persisted key namespace.
//!
//! Every key Docket writes lives under [`ROOT`]:
//!
//! ```text
//! docket/<device>/_/migrations              migration metadata
//! docket/<device>/_/config                  persistence configuration
//! docket/<device>/_/storage_mode            storage-mode flag
//! docket/<device>/_/snapshot                application snapshot
//! docket/<device>/t/<tenant>/entities/<table>/<id>
//! docket/<device>/t/<tenant>/versions/<table>/<id>
//! docket/<device>/t/<tenant>/dirty/<table>/<id>
//! docket/<device>/t/<tenant>/queue/<op_id>
//! docket/<device>/t/<tenant>/queue_seq
//! docket/<device>/t/<tenant>/dead_letter/<op_id>
//! docket/<device>/t/<tenant>/backup         emergency backup snapshot
//! docket/<device>/t/<tenant>/last_saved
//! ```
//!
//! Caller-supplied segments (device, tenant, entity id) are escaped so
//! they never contain `/`. Op ids are zero-padded so lexical order is
//! numeric order.

use crate::types::{DeviceId, EntityKey, Table, TenantId};

/// Prefix shared by every key Docket owns.
pub const ROOT: &str = "docket/";

/// Escapes a caller-supplied path segment.
#[must_use]
pub fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
#[must_use]
pub fn unescape(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

/// Keys for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    device: DeviceId,
    prefix: String,
}

impl Keyspace {
    /// Creates the keyspace of `device`.
    #[must_use]
    pub fn new(device: &DeviceId) -> Self {
        Self {
            device: device.clone(),
            prefix: format!("{ROOT}{}/", escape(device.as_str())),
        }
    }

    /// Returns the device this keyspace belongs to.
    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Prefix of every key of this device.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Migration metadata.
    #[must_use]
    pub fn migrations(&self) -> String {
        format!("{}_/migrations", self.prefix)
    }

    /// Persistence configuration.
    #[must_use]
    pub fn config(&self) -> String {
        format!("{}_/config", self.prefix)
    }

    /// Storage-mode flag.
    #[must_use]
    pub fn storage_mode(&self) -> String {
        format!("{}_/storage_mode", self.prefix)
    }

    /// Application snapshot blob.
    #[must_use]
    pub fn app_snapshot(&self) -> String {
        format!("{}_/snapshot", self.prefix)
    }

    /// Prefix under which every tenant of the device lives.
    #[must_use]
    pub fn tenants_prefix(&self) -> String {
        format!("{}t/", self.prefix)
    }

    /// Keys for one tenant of this device.
    #[must_use]
    pub fn tenant(&self, tenant: &TenantId) -> TenantKeys {
        TenantKeys {
            tenant: tenant.clone(),
            prefix: format!("{}t/{}/", self.prefix, escape(tenant.as_str())),
        }
    }

    /// Extracts the tenant a full key belongs to, if it is tenant-scoped.
    #[must_use]
    pub fn tenant_of(&self, key: &str) -> Option<TenantId> {
        let rest = key.strip_prefix(&self.tenants_prefix())?;
        let segment = rest.split('/').next()?;
        Some(TenantId::new(unescape(segment)))
    }
}

/// Keys for one tenant of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantKeys {
    tenant: TenantId,
    prefix: String,
}

impl TenantKeys {
    /// Returns the tenant these keys belong to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Prefix of every key of this tenant.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Entity record of `key`.
    #[must_use]
    pub fn entity(&self, key: &EntityKey) -> String {
        format!("{}entities/{}/{}", self.prefix, key.table, escape(&key.id))
    }

    /// Prefix of all entity records, or those of one table.
    #[must_use]
    pub fn entities_prefix(&self, table: Option<Table>) -> String {
        self.table_prefix("entities", table)
    }

    /// Version record of `key`.
    #[must_use]
    pub fn version(&self, key: &EntityKey) -> String {
        format!("{}versions/{}/{}", self.prefix, key.table, escape(&key.id))
    }

    /// Prefix of all version records, or those of one table.
    #[must_use]
    pub fn versions_prefix(&self, table: Option<Table>) -> String {
        self.table_prefix("versions", table)
    }

    /// Dirty-index marker of `key`.
    #[must_use]
    pub fn dirty(&self, key: &EntityKey) -> String {
        format!("{}dirty/{}/{}", self.prefix, key.table, escape(&key.id))
    }

    /// Prefix of the dirty index, or the part for one table.
    #[must_use]
    pub fn dirty_prefix(&self, table: Option<Table>) -> String {
        self.table_prefix("dirty", table)
    }

    /// Sync queue item `op_id`.
    #[must_use]
    pub fn queue_item(&self, op_id: u64) -> String {
        format!("{}queue/{op_id:020}", self.prefix)
    }

    /// Prefix of the sync queue.
    #[must_use]
    pub fn queue_prefix(&self) -> String {
        format!("{}queue/", self.prefix)
    }

    /// Last assigned op id.
    #[must_use]
    pub fn queue_seq(&self) -> String {
        format!("{}queue_seq", self.prefix)
    }

    /// Dead-letter record of `op_id`.
    #[must_use]
    pub fn dead_letter(&self, op_id: u64) -> String {
        format!("{}dead_letter/{op_id:020}", self.prefix)
    }

    /// Prefix of the dead-letter records.
    #[must_use]
    pub fn dead_letter_prefix(&self) -> String {
        format!("{}dead_letter/", self.prefix)
    }

    /// Emergency backup snapshot.
    #[must_use]
    pub fn backup(&self) -> String {
        format!("{}backup", self.prefix)
    }

    /// Last-saved marker.
    #[must_use]
    pub fn last_saved(&self) -> String {
        format!("{}last_saved", self.prefix)
    }

    /// Parses the entity addressed by a key under `entities/`, `versions/`
    /// or `dirty/`.
    #[must_use]
    pub fn parse_entity_key(&self, key: &str) -> Option<EntityKey> {
        let rest = key.strip_prefix(&self.prefix)?;
        let mut parts = rest.splitn(3, '/');
        let concern = parts.next()?;
        if !matches!(concern, "entities" | "versions" | "dirty") {
            return None;
        }
        let table = parts.next()?.parse().ok()?;
        let id = parts.next()?;
        Some(EntityKey::new(table, unescape(id)))
    }

    fn table_prefix(&self, concern: &str, table: Option<Table>) -> String {
        match table {
            Some(t) => format!("{}{concern}/{t}/", self.prefix),
            None => format!("{}{concern}/", self.prefix),
        }
    }
}

/// Names the concern a full key belongs to, for offline inspection.
#[must_use]
pub fn concern_of(key: &str) -> &'static str {
    let Some(rest) = key.strip_prefix(ROOT) else {
        return "foreign";
    };
    let mut parts = rest.split('/').skip(1);
    match parts.next() {
        Some("_") => match parts.next() {
            Some("migrations") => "migrations",
            Some("config") => "config",
            Some("storage_mode") => "storage_mode",
            Some("snapshot") => "snapshot",
            _ => "unknown",
        },
        Some("t") => match parts.nth(1) {
            Some("entities") => "entities",
            Some("versions") => "versions",
            Some("dirty") => "dirty",
            Some("queue") => "queue",
            Some("queue_seq") => "queue_seq",
            Some("dead_letter") => "dead_letter",
            Some("backup") => "backup",
            Some("last_saved") => "last_saved",
            _ => "unknown",
        },
        _ => "unknown",
    }
}

/// Extracts the device a full key belongs to.
#[must_use]
pub fn device_of(key: &str) -> Option<DeviceId> {
    let rest = key.strip_prefix(ROOT)?;
    let segment = rest.split('/').next()?;
    Some(DeviceId::new(unescape(segment)))
}
