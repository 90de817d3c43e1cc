//! Multi-engine database query queues
//!
//! Each database gets a Lead queue holding a persistent connection; the
//! Lead spawns Worker queues per query class and routes submissions to
//! them. Engines plug in through the `EngineConnector` trait.

pub mod config;
pub mod database;
pub mod engine;
pub mod queue;
pub mod manager;
pub mod dispatch;

// Re-export main types for easy access
pub use config::{ChildPolicy, DatabaseDefinition, QueueConfig};
pub use database::{DatabaseQuery, NameCache, QueryOutcome, StatementCache};
pub use engine::{ConnectionConfig, EngineConnector, EngineError, EngineKind, EngineRegistry};
pub use queue::{select_type, DatabaseQueue, QueueError, QueueState, QueueType, Rejected};
pub use manager::{DatabaseQueueManager, DqmStats, DqmStatsSnapshot, ManagerError};
pub use dispatch::{DispatchError, QueryDispatcher};
