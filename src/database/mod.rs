//! Database Module
//!
//! Query model and the prepared statement caches used by queue
//! connections.

pub mod query;
pub mod statement_cache;
pub mod name_cache;

use crate::engine::{EngineError, EngineKind};

// Re-export main types
pub use query::{DatabaseQuery, QueryOutcome, derive_statement_name, unix_now};
pub use statement_cache::{StatementCache, PreparedStatement, StatementCacheStats};
pub use name_cache::NameCache;

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Connector for {connector} cannot use a {connection} connection")]
    EngineMismatch {
        connector: EngineKind,
        connection: EngineKind,
    },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Allocation failed: {0}")]
    Allocation(String),
}
