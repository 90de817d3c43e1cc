//! Database Queue Module
//!
//! Lead/Worker queue hierarchy. Each queue owns a FIFO of pending
//! queries, one OS thread, and a persistent engine connection with its
//! prepared statement cache. A Lead additionally owns up to four Worker
//! children, one per queue type.

pub mod types;
pub mod database_queue;
pub mod worker;
pub mod heartbeat;
pub mod lead;

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::database::{CacheError, DatabaseQuery};
use crate::engine::{EngineError, EngineRegistry};
use crate::manager::DqmStats;

// Re-export main types
pub use types::{select_type, QueueState, QueueType};
pub use database_queue::{DatabaseQueue, QueueStats, QueueStatsSnapshot};
pub use lead::MigrationLease;

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database name must not be empty")]
    EmptyDatabaseName,

    #[error("Connection string must not be empty")]
    EmptyConnectionString,

    #[error("Query {0} has no SQL")]
    EmptyQuery(String),

    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    #[error("Unknown queue type: {0}")]
    UnknownQueueType(String),

    #[error("Queue {0} is shutting down")]
    ShuttingDown(String),

    #[error("Only a Lead queue can {0}")]
    NotLead(&'static str),

    #[error("A Lead cannot be created as a worker or child")]
    LeadAsWorker,

    #[error("Child queue limit reached ({0})")]
    ChildLimitReached(usize),

    #[error("A {0} child queue already exists")]
    DuplicateChild(QueueType),

    #[error("No database connection available")]
    NotConnected,

    #[error("Failed to start worker thread: {0}")]
    ThreadSpawn(String),

    #[error("Statement cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl QueueError {
    /// Whether the error is an engine-reported timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            QueueError::Engine(EngineError::Timeout(_))
                | QueueError::Cache(CacheError::Engine(EngineError::Timeout(_)))
        )
    }
}

/// A submission the queue refused. Ownership of the query returns to the caller.
#[derive(Debug, thiserror::Error)]
#[error("Query rejected: {reason}")]
pub struct Rejected {
    pub reason: QueueError,
    pub query: DatabaseQuery,
}

impl Rejected {
    pub fn new(reason: QueueError, query: DatabaseQuery) -> Self {
        Self { reason, query }
    }

    /// Take the query back
    pub fn into_query(self) -> DatabaseQuery {
        self.query
    }
}

/// Shared services every queue of a manager uses
#[derive(Clone)]
pub struct QueueContext {
    /// Connector lookup
    pub engines: Arc<EngineRegistry>,

    pub config: Arc<QueueConfig>,

    /// Aggregate counters the queues report into
    pub stats: Arc<DqmStats>,
}

impl QueueContext {
    pub fn new(engines: Arc<EngineRegistry>, config: Arc<QueueConfig>) -> Self {
        Self {
            engines,
            config,
            stats: Arc::new(DqmStats::default()),
        }
    }

    /// Report into an existing set of aggregate counters
    pub fn with_stats(mut self, stats: Arc<DqmStats>) -> Self {
        self.stats = stats;
        self
    }
}
