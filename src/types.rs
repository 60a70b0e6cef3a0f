//! Core type definitions for the coordination layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Schema used when a table name carries no schema prefix
pub const DEFAULT_SCHEMA: &str = "PUBLIC";

/// Network address of an instance endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of one database process.
///
/// Equality, hashing and ordering use (host, port, location) only; the
/// system-table flag is descriptive payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseId {
    pub host: String,
    pub port: u16,
    pub location: String,
    pub is_system_table: bool,
}

impl DatabaseId {
    pub fn new(host: impl Into<String>, port: u16, location: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            location: location.into(),
            is_system_table: false,
        }
    }

    /// Endpoint where this instance serves RPC and ring traffic
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn url(&self) -> String {
        format!("db://{}:{}/{}", self.host, self.port, self.location)
    }

    /// Parse `db://host:port/location`
    pub fn from_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("db://")?;
        let (endpoint, location) = rest.split_once('/')?;
        let (host, port) = endpoint.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() || location.is_empty() {
            return None;
        }
        Some(Self::new(host, port, location))
    }

    fn identity(&self) -> (&str, u16, &str) {
        (&self.host, self.port, &self.location)
    }
}

impl PartialEq for DatabaseId {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for DatabaseId {}

impl Hash for DatabaseId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for DatabaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatabaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Table identity plus optional payload.
///
/// Only (schema_name, table_name) take part in equality and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema_name: String,
    pub table_name: String,
    pub modification_id: Option<u64>,
    pub table_set_id: Option<i64>,
    pub owner: Option<DatabaseId>,
}

impl TableInfo {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            modification_id: None,
            table_set_id: None,
            owner: None,
        }
    }

    /// Build from `SCHEMA.TABLE`; a bare `TABLE` lands in the default schema.
    pub fn from_full_name(full_name: &str) -> Self {
        match full_name.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(DEFAULT_SCHEMA, full_name),
        }
    }

    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn with_owner(&self, owner: DatabaseId) -> Self {
        Self {
            owner: Some(owner),
            ..self.clone()
        }
    }

    pub fn with_table_set(&self, table_set_id: i64) -> Self {
        Self {
            table_set_id: Some(table_set_id),
            ..self.clone()
        }
    }
}

impl PartialEq for TableInfo {
    fn eq(&self, other: &Self) -> bool {
        self.schema_name == other.schema_name && self.table_name == other.table_name
    }
}

impl Eq for TableInfo {}

impl Hash for TableInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema_name.hash(state);
        self.table_name.hash(state);
    }
}

impl PartialOrd for TableInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.schema_name, &self.table_name).cmp(&(&other.schema_name, &other.table_name))
    }
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_table_name())
    }
}

/// Lock levels granted by a table manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockType {
    None,
    Read,
    Write,
    /// Schema-altering DDL; implies WRITE
    Create,
}

impl LockType {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockType::Write | LockType::Create)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::None => "NONE",
            LockType::Read => "READ",
            LockType::Write => "WRITE",
            LockType::Create => "CREATE",
        };
        write!(f, "{}", name)
    }
}

/// Lock holder identity: requesting instance plus its session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    pub database: DatabaseId,
    pub session_id: u64,
}

impl LockRequest {
    pub fn new(database: DatabaseId, session_id: u64) -> Self {
        Self {
            database,
            session_id,
        }
    }
}

/// Update ordering information shipped with a replicated write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStamp {
    pub table: TableInfo,
    /// ID this write will carry once committed
    pub update_id: u64,
    /// ID the replica must already hold for the write to be in order
    pub previous_update_id: u64,
}

/// Replica response to PREPARE+EXECUTE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAck {
    /// PREPARE result; zero means ready to commit
    pub result: i32,
    /// Update ID the replica held before this write, when stamped
    pub observed_update_id: Option<u64>,
}

/// Outcome of one replica within a commit round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub replica: DatabaseId,
    pub commit: bool,
    pub update_id: u64,
    pub expected_update_id: u64,
    /// `None` marks a bare COMMIT/ROLLBACK marker rather than a table update
    pub table: Option<TableInfo>,
}

impl CommitResult {
    pub fn is_in_order(&self) -> bool {
        self.update_id == self.expected_update_id
    }
}

/// One replica a writer must target, with the update ID last recorded for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaTarget {
    pub database: DatabaseId,
    pub update_id: u64,
}

/// Where a table manager currently runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableManagerRef {
    pub table: TableInfo,
    pub location: DatabaseId,
}

impl TableManagerRef {
    pub fn new(table: TableInfo, location: DatabaseId) -> Self {
        Self { table, location }
    }
}

/// Granted lock plus the replicas the holder must write to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProxy {
    pub manager: TableManagerRef,
    pub lock_granted: LockType,
    pub lock_request: LockRequest,
    pub replicas: Vec<ReplicaTarget>,
    /// New update ID for exclusive locks, current one otherwise
    pub update_id: u64,
    /// Highest update ID across the active replicas before this round
    pub expected_update_id: u64,
}

impl TableProxy {
    pub fn table(&self) -> &TableInfo {
        &self.manager.table
    }

    pub fn stamp(&self) -> UpdateStamp {
        UpdateStamp {
            table: self.manager.table.clone(),
            update_id: self.update_id,
            previous_update_id: self.expected_update_id,
        }
    }
}

/// CONNECTIONS relation row of the system table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub database: DatabaseId,
    pub active: bool,
    pub endpoint: NodeAddress,
    pub last_seen: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(database: DatabaseId) -> Self {
        let endpoint = database.address();
        Self {
            database,
            active: true,
            endpoint,
            last_seen: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_database_id_equality_ignores_flag() {
        let a = DatabaseId::new("alpha", 9000, "db1");
        let mut b = a.clone();
        b.is_system_table = true;
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(b, DatabaseId::new("alpha", 9001, "db1"));
    }

    #[test]
    fn test_database_url_round_trip() {
        let id = DatabaseId::new("alpha.example", 9000, "data/db1");
        assert_eq!(id.url(), "db://alpha.example:9000/data/db1");
        assert_eq!(DatabaseId::from_url(&id.url()), Some(id));
        assert_eq!(DatabaseId::from_url("db://nohost"), None);
        assert_eq!(DatabaseId::from_url("http://a:1/b"), None);
    }

    #[test]
    fn test_table_info_full_name_round_trip() {
        let info = TableInfo::from_full_name("SALES.ORDERS");
        assert_eq!(info.schema_name, "SALES");
        assert_eq!(info.table_name, "ORDERS");
        assert_eq!(info.full_table_name(), "SALES.ORDERS");
    }

    #[test]
    fn test_table_info_default_schema() {
        let info = TableInfo::from_full_name("ORDERS");
        assert_eq!(info.full_table_name(), "PUBLIC.ORDERS");
    }

    #[test]
    fn test_table_info_identity_ignores_payload() {
        let plain = TableInfo::new("PUBLIC", "T");
        let owned = plain
            .with_owner(DatabaseId::new("a", 1, "x"))
            .with_table_set(7);
        assert_eq!(plain, owned);

        let mut set = HashSet::new();
        set.insert(owned);
        assert!(set.contains(&plain));
    }

    #[test]
    fn test_lock_type_exclusive() {
        assert!(!LockType::Read.is_exclusive());
        assert!(LockType::Write.is_exclusive());
        assert!(LockType::Create.is_exclusive());
        assert!(LockType::Create > LockType::Write);
    }
}
