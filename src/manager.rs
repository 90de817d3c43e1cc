//! Database Queue Manager
//!
//! Registry of Lead queues keyed by database name, and the aggregate
//! counters every queue of the process reports into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{DatabaseDefinition, QueueConfig};
use crate::database::unix_now;
use crate::engine::EngineRegistry;
use crate::queue::{DatabaseQueue, QueueContext, QueueError, QueueType};

/// Manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Manager is full ({0} databases)")]
    Full(usize),

    #[error("Database already registered: {0}")]
    DuplicateDatabase(String),

    #[error("Queue {0} is not a Lead queue")]
    NotLead(String),

    #[error("Queue {0} reports into another manager's stats")]
    ForeignContext(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Default)]
struct TypeCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    total_execution_us: AtomicU64,
    last_used: AtomicU64,
}

/// Process-wide counters, one slot per queue type
#[derive(Debug, Default)]
pub struct DqmStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    selections: [AtomicU64; 5],
    per_type: [TypeCounters; 5],
}

impl DqmStats {
    pub fn record_submission(&self, queue_type: QueueType) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let slot = &self.per_type[queue_type.index()];
        slot.submitted.fetch_add(1, Ordering::Relaxed);
        slot.last_used.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_completion(&self, queue_type: QueueType, execution_us: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let slot = &self.per_type[queue_type.index()];
        slot.completed.fetch_add(1, Ordering::Relaxed);
        slot.total_execution_us.fetch_add(execution_us, Ordering::Relaxed);
        slot.last_used.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_failure(&self, queue_type: QueueType) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let slot = &self.per_type[queue_type.index()];
        slot.failed.fetch_add(1, Ordering::Relaxed);
        slot.last_used.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_timeout(&self, queue_type: QueueType) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.per_type[queue_type.index()]
            .timeouts
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatcher routing decision
    pub fn increment_selection(&self, queue_type: QueueType) {
        self.selections[queue_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DqmStatsSnapshot {
        let per_queue_stats = QueueType::ALL
            .iter()
            .map(|queue_type| {
                let slot = &self.per_type[queue_type.index()];
                let completed = slot.completed.load(Ordering::Relaxed);
                let total = slot.total_execution_us.load(Ordering::Relaxed);
                QueueTypeStats {
                    queue_type: queue_type.stats_name().to_string(),
                    submitted: slot.submitted.load(Ordering::Relaxed),
                    completed,
                    failed: slot.failed.load(Ordering::Relaxed),
                    timeouts: slot.timeouts.load(Ordering::Relaxed),
                    avg_execution_time_us: if completed == 0 { 0 } else { total / completed },
                    last_used: slot.last_used.load(Ordering::Relaxed),
                }
            })
            .collect();

        DqmStatsSnapshot {
            total_queries_submitted: self.submitted.load(Ordering::Relaxed),
            total_queries_completed: self.completed.load(Ordering::Relaxed),
            total_queries_failed: self.failed.load(Ordering::Relaxed),
            total_timeouts: self.timeouts.load(Ordering::Relaxed),
            queue_selection_counters: self
                .selections
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .collect(),
            per_queue_stats,
        }
    }
}

/// Stats of one queue type across all databases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTypeStats {
    pub queue_type: String,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub avg_execution_time_us: u64,

    /// Unix seconds of the last activity, 0 if never used
    pub last_used: u64,
}

/// Stats document consumed by monitoring. Always five slots in the
/// order slow, medium, fast, cache, lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DqmStatsSnapshot {
    pub total_queries_submitted: u64,
    pub total_queries_completed: u64,
    pub total_queries_failed: u64,
    pub total_timeouts: u64,
    pub queue_selection_counters: Vec<u64>,
    pub per_queue_stats: Vec<QueueTypeStats>,
}

/// Registry of Lead queues
pub struct DatabaseQueueManager {
    max_databases: usize,
    databases: RwLock<Vec<Arc<DatabaseQueue>>>,
    context: QueueContext,
}

impl DatabaseQueueManager {
    pub fn new(max_databases: usize, engines: Arc<EngineRegistry>, config: Arc<QueueConfig>) -> Self {
        log::info!("Database queue manager created (max {} databases)", max_databases);
        Self {
            max_databases,
            databases: RwLock::new(Vec::new()),
            context: QueueContext::new(engines, config),
        }
    }

    /// Shared services handed to every queue created through this manager
    pub fn context(&self) -> &QueueContext {
        &self.context
    }

    pub fn max_databases(&self) -> usize {
        self.max_databases
    }

    /// Create a Lead queue wired to this manager's engines and counters.
    /// The queue is neither registered nor started.
    pub fn create_lead(
        &self,
        database_name: &str,
        connection_string: &str,
        bootstrap_query: Option<&str>,
    ) -> Result<Arc<DatabaseQueue>, ManagerError> {
        Ok(DatabaseQueue::create_lead(
            database_name,
            connection_string,
            bootstrap_query,
            self.context.clone(),
        )?)
    }

    /// Create, register and start the Lead for a configured database
    pub fn create_database(&self, definition: &DatabaseDefinition) -> Result<Arc<DatabaseQueue>, ManagerError> {
        let lead = self.create_lead(
            &definition.name,
            &definition.connection_string,
            definition.bootstrap_query.as_deref(),
        )?;
        lead.set_child_policy(self.context.config.policy_for(definition));
        self.add_database(Arc::clone(&lead))?;

        if let Err(e) = lead.start_worker() {
            self.remove_database(&definition.name);
            return Err(e.into());
        }
        Ok(lead)
    }

    /// Register a Lead queue under its database name. The Lead must have
    /// been created with this manager's context.
    pub fn add_database(&self, lead: Arc<DatabaseQueue>) -> Result<(), ManagerError> {
        if !lead.is_lead_queue() {
            return Err(ManagerError::NotLead(lead.label()));
        }
        if !Arc::ptr_eq(&lead.context.stats, &self.context.stats) {
            return Err(ManagerError::ForeignContext(lead.label()));
        }

        let mut databases = self.databases.write();
        if databases.len() >= self.max_databases {
            return Err(ManagerError::Full(self.max_databases));
        }
        if databases
            .iter()
            .any(|existing| existing.database_name() == lead.database_name())
        {
            return Err(ManagerError::DuplicateDatabase(lead.database_name().to_string()));
        }

        log::info!("{}: registered", lead.label());
        databases.push(lead);
        Ok(())
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<DatabaseQueue>> {
        self.databases
            .read()
            .iter()
            .find(|lead| lead.database_name() == name)
            .cloned()
    }

    /// Unregister and shut down a database. Returns false if unknown.
    pub fn remove_database(&self, name: &str) -> bool {
        let removed = {
            let mut databases = self.databases.write();
            databases
                .iter()
                .position(|lead| lead.database_name() == name)
                .map(|index| databases.remove(index))
        };

        match removed {
            Some(lead) => {
                lead.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases
            .read()
            .iter()
            .map(|lead| lead.database_name().to_string())
            .collect()
    }

    pub fn stats(&self) -> DqmStatsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }

    /// Per-database status, one entry per registered Lead
    pub fn databases_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.databases
                .read()
                .iter()
                .map(|lead| lead.stats_json())
                .collect(),
        )
    }

    /// Shut down every registered queue
    pub fn shutdown(&self) {
        let databases: Vec<Arc<DatabaseQueue>> = std::mem::take(&mut *self.databases.write());
        if databases.is_empty() {
            return;
        }
        log::info!("Shutting down {} databases", databases.len());
        for lead in databases {
            lead.shutdown();
        }
    }
}

impl Drop for DatabaseQueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
