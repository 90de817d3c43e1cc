//! Engine Connector Module
//!
//! The small capability set every database engine adapter exposes to the
//! queue core (connect, prepare, execute, unprepare, health probe and
//! disconnect), plus connection-string handling and connector resolution.

pub mod connstring;
pub mod registry;
pub mod dynamic;
pub mod memory;

use std::fmt;
use serde::{Deserialize, Serialize};

// Re-export main types
pub use connstring::{ConnectionConfig, mask_connection_string};
pub use registry::EngineRegistry;
pub use dynamic::DynamicConnector;
pub use memory::{MemoryConnector, CallCounts};

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    PostgreSql,
    MySql,
    Sqlite,
    Db2,
}

impl EngineKind {
    /// All engines, in registry order
    pub const ALL: [EngineKind; 4] = [
        EngineKind::PostgreSql,
        EngineKind::MySql,
        EngineKind::Sqlite,
        EngineKind::Db2,
    ];

    /// Normalized engine name used for library lookup
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::PostgreSql => "postgresql",
            EngineKind::MySql => "mysql",
            EngineKind::Sqlite => "sqlite",
            EngineKind::Db2 => "db2",
        }
    }

    /// Map a user-supplied engine name onto an engine (case-insensitive)
    pub fn normalize(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Some(EngineKind::PostgreSql),
            "mysql" | "mariadb" => Some(EngineKind::MySql),
            "sqlite" | "sqlite3" => Some(EngineKind::Sqlite),
            "db2" => Some(EngineKind::Db2),
            _ => None,
        }
    }

    /// Detect the engine a connection string targets.
    ///
    /// URL schemes win, then the DB2 `DATABASE=` keyword form; anything
    /// else is treated as a SQLite path.
    pub fn from_connection_string(conn_str: &str) -> Self {
        if conn_str.starts_with("postgresql://") || conn_str.starts_with("postgres://") {
            EngineKind::PostgreSql
        } else if conn_str.starts_with("mysql://") {
            EngineKind::MySql
        } else if conn_str.contains("DATABASE=") {
            EngineKind::Db2
        } else {
            EngineKind::Sqlite
        }
    }

    /// Default TCP port for network engines
    pub fn default_port(self) -> Option<u16> {
        match self {
            EngineKind::PostgreSql => Some(5432),
            EngineKind::MySql => Some(3306),
            EngineKind::Db2 => Some(50000),
            EngineKind::Sqlite => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque connection handle issued by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    engine: EngineKind,
    raw: u64,
}

impl ConnectionHandle {
    pub fn new(engine: EngineKind, raw: u64) -> Self {
        Self { engine, raw }
    }

    /// Engine that issued this handle
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

/// Opaque prepared-statement handle, owned by the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(u64);

impl StatementHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A single execution request handed to a connector
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_id: String,
    pub sql: String,
    pub parameters_json: String,
    pub timeout_seconds: u32,
}

/// Result of executing a prepared statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows as a JSON document, if the engine returned any
    pub data_json: Option<String>,
    pub row_count: u64,
    pub column_count: u32,
    pub affected_rows: u64,
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine library unavailable for {engine}: {reason}")]
    LibraryUnavailable { engine: EngineKind, reason: String },

    #[error("No connector registered for engine: {0}")]
    NotRegistered(EngineKind),

    #[error("Unknown engine name: {0}")]
    UnknownEngine(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Prepare failed for {name}: {reason}")]
    Prepare { name: String, reason: String },

    #[error("Execution failed: {0}")]
    Execute(String),

    #[error("Query timed out after {0}s")]
    Timeout(u32),
}

/// Per-engine capability set consumed by the queue core.
///
/// Implementations must be callable from any queue thread; every call is
/// a blocking operation bounded by the engine's own timeouts.
pub trait EngineConnector: Send + Sync {
    /// Engine this connector speaks to
    fn kind(&self) -> EngineKind;

    /// Open a new connection
    fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, EngineError>;

    /// Prepare a named statement on a connection
    fn prepare(
        &self,
        connection: ConnectionHandle,
        name: &str,
        sql: &str,
    ) -> Result<StatementHandle, EngineError>;

    /// Execute a previously prepared statement
    fn execute_prepared(
        &self,
        connection: ConnectionHandle,
        statement: StatementHandle,
        request: &QueryRequest,
    ) -> Result<QueryResult, EngineError>;

    /// Release a prepared statement
    fn unprepare(&self, connection: ConnectionHandle, statement: StatementHandle);

    /// Lightweight liveness probe
    fn health_check(&self, connection: ConnectionHandle) -> bool;

    /// Close a connection
    fn disconnect(&self, connection: ConnectionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_detection() {
        assert_eq!(EngineKind::from_connection_string("postgresql://u:p@h/db"), EngineKind::PostgreSql);
        assert_eq!(EngineKind::from_connection_string("postgres://h/db"), EngineKind::PostgreSql);
        assert_eq!(EngineKind::from_connection_string("mysql://root@localhost/app"), EngineKind::MySql);
        assert_eq!(EngineKind::from_connection_string("DATABASE=SAMPLE;HOSTNAME=h;UID=u;PWD=p;"), EngineKind::Db2);
        assert_eq!(EngineKind::from_connection_string("sqlite:///tmp/test.db"), EngineKind::Sqlite);
        assert_eq!(EngineKind::from_connection_string("/var/lib/app.db"), EngineKind::Sqlite);
    }

    #[test]
    fn test_engine_name_normalization() {
        assert_eq!(EngineKind::normalize("Postgres"), Some(EngineKind::PostgreSql));
        assert_eq!(EngineKind::normalize("SQLITE3"), Some(EngineKind::Sqlite));
        assert_eq!(EngineKind::normalize(" db2 "), Some(EngineKind::Db2));
        assert_eq!(EngineKind::normalize("oracle"), None);

        for kind in EngineKind::ALL {
            assert_eq!(EngineKind::normalize(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(EngineKind::PostgreSql.default_port(), Some(5432));
        assert_eq!(EngineKind::MySql.default_port(), Some(3306));
        assert_eq!(EngineKind::Sqlite.default_port(), None);
    }
}
