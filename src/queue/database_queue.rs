//! Database Queue Implementation
//!
//! A queue owns a FIFO of pending queries, the thread that drains it,
//! and a persistent engine connection. The same type serves both roles:
//! the Lead (queue number 0, one per database) and its Worker children.
//!
//! Locks, each guarding one concern:
//! - `pending`: the FIFO, shared by submitters and the queue thread
//! - `connection`: connection handle, statement cache and migration lease
//! - `children`: the Lead's Worker children

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::json;

use crate::config::ChildPolicy;
use crate::database::{DatabaseQuery, NameCache, QueryOutcome, StatementCache};
use crate::engine::{mask_connection_string, ConnectionHandle, EngineConnector, QueryRequest, QueryResult};
use super::worker::Semaphore;
use super::{QueueContext, QueueError, QueueState, QueueType, Rejected};

/// Depth above which `health_check` warns
pub const DEPTH_WARNING_THRESHOLD: usize = 10_000;

/// Connection owned by a queue
#[derive(Default)]
pub(crate) struct ConnectionState {
    pub(crate) connector: Option<Arc<dyn EngineConnector>>,
    pub(crate) handle: Option<ConnectionHandle>,

    /// Lives and dies with `handle`
    pub(crate) statements: Option<StatementCache>,

    /// Active migration lease id
    pub(crate) lease: Option<u64>,
    pub(crate) next_lease: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeartbeatTimers {
    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) last_connection_attempt: Option<Instant>,
}

/// Per-queue counters
#[derive(Debug, Default)]
pub struct QueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    total_execution_us: AtomicU64,
}

/// Point-in-time copy of `QueueStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub avg_execution_time_us: u64,
}

impl QueueStats {
    pub(crate) fn record_submission(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self, execution_us: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_us.fetch_add(execution_us, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total = self.total_execution_us.load(Ordering::Relaxed);
        QueueStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_execution_time_us: if completed == 0 { 0 } else { total / completed },
        }
    }
}

/// A Lead or Worker queue
pub struct DatabaseQueue {
    pub(crate) database_name: String,
    pub(crate) connection_string: String,
    pub(crate) queue_type: QueueType,
    pub(crate) queue_number: usize,
    pub(crate) tags: Mutex<String>,

    /// `None`: no bootstrap. `Some("")`: present, never executed.
    pub(crate) bootstrap_query: Option<String>,

    pub(crate) context: QueueContext,

    /// Statement names prepared anywhere in this database
    pub(crate) statement_names: Arc<NameCache>,

    pub(crate) pending: Mutex<VecDeque<DatabaseQuery>>,
    pub(crate) work_signal: Semaphore,

    pub(crate) connection: Mutex<ConnectionState>,
    pub(crate) connection_released: Condvar,

    pub(crate) initial_connection: Mutex<bool>,
    pub(crate) initial_connection_cond: Condvar,

    pub(crate) children: Mutex<Vec<Arc<DatabaseQueue>>>,
    pub(crate) child_policy: Mutex<ChildPolicy>,

    pub(crate) stats: QueueStats,
    state: AtomicU8,
    pub(crate) shutdown_requested: AtomicBool,
    pub(crate) worker_thread_started: AtomicBool,
    pub(crate) is_connected: AtomicBool,
    pub(crate) initial_connection_attempted: AtomicBool,
    pub(crate) bootstrap_completed: AtomicBool,
    pub(crate) timers: Mutex<HeartbeatTimers>,
    pub(crate) last_activity: Mutex<Instant>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseQueue {
    /// Create the Lead queue for a database. The worker thread is not started.
    pub fn create_lead(
        database_name: &str,
        connection_string: &str,
        bootstrap_query: Option<&str>,
        context: QueueContext,
    ) -> Result<Arc<Self>, QueueError> {
        let names = Arc::new(NameCache::new(context.config.name_cache_initial_capacity));
        let policy = context.config.child_policy.clone();
        Self::build(
            database_name,
            connection_string,
            QueueType::Lead,
            0,
            QueueType::Lead.default_tags(),
            bootstrap_query.map(str::to_string),
            names,
            policy,
            context,
        )
    }

    /// Create a standalone Worker queue. The worker thread is not started.
    pub fn create_worker(
        database_name: &str,
        connection_string: &str,
        queue_type: QueueType,
        tags: Option<&str>,
        context: QueueContext,
    ) -> Result<Arc<Self>, QueueError> {
        if !queue_type.is_worker() {
            return Err(QueueError::LeadAsWorker);
        }
        let names = Arc::new(NameCache::new(context.config.name_cache_initial_capacity));
        let tags = tags
            .map(str::to_string)
            .unwrap_or_else(|| queue_type.default_tags());
        Self::build(
            database_name,
            connection_string,
            queue_type,
            1,
            tags,
            None,
            names,
            ChildPolicy::default(),
            context,
        )
    }

    /// Create a Worker child sharing this Lead's database and name cache
    pub(crate) fn create_child(
        &self,
        queue_type: QueueType,
        queue_number: usize,
    ) -> Result<Arc<Self>, QueueError> {
        if !queue_type.is_worker() {
            return Err(QueueError::LeadAsWorker);
        }
        Self::build(
            &self.database_name,
            &self.connection_string,
            queue_type,
            queue_number,
            queue_type.default_tags(),
            None,
            Arc::clone(&self.statement_names),
            ChildPolicy::default(),
            self.context.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        database_name: &str,
        connection_string: &str,
        queue_type: QueueType,
        queue_number: usize,
        tags: String,
        bootstrap_query: Option<String>,
        statement_names: Arc<NameCache>,
        child_policy: ChildPolicy,
        context: QueueContext,
    ) -> Result<Arc<Self>, QueueError> {
        if database_name.is_empty() {
            return Err(QueueError::EmptyDatabaseName);
        }
        if connection_string.is_empty() {
            return Err(QueueError::EmptyConnectionString);
        }

        let queue = Arc::new(Self {
            database_name: database_name.to_string(),
            connection_string: connection_string.to_string(),
            queue_type,
            queue_number,
            tags: Mutex::new(tags),
            bootstrap_query,
            context,
            statement_names,
            pending: Mutex::new(VecDeque::new()),
            work_signal: Semaphore::new(),
            connection: Mutex::new(ConnectionState::default()),
            connection_released: Condvar::new(),
            initial_connection: Mutex::new(false),
            initial_connection_cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
            child_policy: Mutex::new(child_policy),
            stats: QueueStats::default(),
            state: AtomicU8::new(QueueState::Created as u8),
            shutdown_requested: AtomicBool::new(false),
            worker_thread_started: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            initial_connection_attempted: AtomicBool::new(false),
            bootstrap_completed: AtomicBool::new(false),
            timers: Mutex::new(HeartbeatTimers::default()),
            last_activity: Mutex::new(Instant::now()),
            worker: Mutex::new(None),
        });

        log::debug!(
            "{}: created for {}",
            queue.label(),
            mask_connection_string(connection_string)
        );
        Ok(queue)
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn queue_number(&self) -> usize {
        self.queue_number
    }

    pub fn is_lead_queue(&self) -> bool {
        self.queue_type == QueueType::Lead
    }

    pub fn can_spawn_queues(&self) -> bool {
        self.is_lead_queue()
    }

    pub fn bootstrap_query(&self) -> Option<&str> {
        self.bootstrap_query.as_deref()
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn advance_state(&self, state: QueueState) {
        self.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn worker_thread_started(&self) -> bool {
        self.worker_thread_started.load(Ordering::SeqCst)
    }

    pub fn initial_connection_attempted(&self) -> bool {
        self.initial_connection_attempted.load(Ordering::SeqCst)
    }

    pub fn bootstrap_completed(&self) -> bool {
        self.bootstrap_completed.load(Ordering::SeqCst)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.context.config.heartbeat_interval()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.timers.lock().last_heartbeat
    }

    pub fn last_connection_attempt(&self) -> Option<Instant> {
        self.timers.lock().last_connection_attempt
    }

    /// Statement names prepared by any queue of this database
    pub fn statement_names(&self) -> &Arc<NameCache> {
        &self.statement_names
    }

    /// Statements currently cached on this queue's connection
    pub fn prepared_statement_count(&self) -> usize {
        self.connection
            .lock()
            .statements
            .as_ref()
            .map(StatementCache::len)
            .unwrap_or(0)
    }

    /// Time since the queue last accepted or finished a query
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn tags(&self) -> String {
        self.tags.lock().clone()
    }

    pub fn set_tags(&self, tags: &str) {
        *self.tags.lock() = tags.to_string();
    }

    /// Add a tag letter; no-op if already present
    pub fn add_tag(&self, tag: char) {
        let mut tags = self.tags.lock();
        if !tags.contains(tag) {
            tags.push(tag);
        }
    }

    pub fn remove_tag(&self, tag: char) {
        self.tags.lock().retain(|c| c != tag);
    }

    /// Diagnostic label `DQM-<database>-<NN>-<tags>`. The Lead's implied
    /// `L` tag is left out.
    pub fn label(&self) -> String {
        let mut tags = self.tags();
        if self.queue_number == 0 {
            tags.retain(|c| c != 'L');
        }
        format!("DQM-{}-{:02}-{}", self.database_name, self.queue_number, tags)
    }

    /// Queue a query for this queue's thread.
    ///
    /// Rejected queries are handed back untouched and do not count as
    /// submitted.
    pub fn submit(&self, query: DatabaseQuery) -> Result<(), Rejected> {
        self.enqueue(query, true)
    }

    /// Take over a query already counted as submitted by a retired child
    pub(crate) fn requeue(&self, query: DatabaseQuery) -> Result<(), Rejected> {
        self.enqueue(query, false)
    }

    fn enqueue(&self, query: DatabaseQuery, count_submission: bool) -> Result<(), Rejected> {
        if !query.is_valid() {
            let query_id = query.query_id.clone();
            return Err(Rejected::new(QueueError::EmptyQuery(query_id), query));
        }

        let depth = {
            let mut pending = self.pending.lock();
            if self.is_shutdown_requested() {
                drop(pending);
                return Err(Rejected::new(QueueError::ShuttingDown(self.label()), query));
            }
            pending.push_back(query);
            pending.len()
        };

        if count_submission {
            self.stats.record_submission();
            self.context.stats.record_submission(self.queue_type);
        }
        *self.last_activity.lock() = Instant::now();
        self.work_signal.post();

        log::trace!("{}: query queued (depth {})", self.label(), depth);
        Ok(())
    }

    /// Pending queries in this queue only
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pending queries here whose hint names `queue_type`
    pub fn pending_for(&self, queue_type: QueueType) -> usize {
        self.pending
            .lock()
            .iter()
            .filter(|query| query.queue_type_hint == queue_type)
            .count()
    }

    /// Pending queries here plus, for a Lead, in every child
    pub fn depth(&self) -> usize {
        let own = self.pending_len();
        let children: usize = self
            .child_queues()
            .iter()
            .map(|child| child.depth())
            .sum();
        own + children
    }

    /// Execute the oldest pending query on the calling thread.
    /// Returns false if nothing was pending.
    pub fn process_next(&self) -> bool {
        let query = self.pending.lock().pop_front();
        match query {
            Some(query) => {
                self.execute(query);
                true
            }
            None => false,
        }
    }

    fn execute(&self, query: DatabaseQuery) {
        let started = Instant::now();
        let result = self.run_query(&query);
        let execution_time_us = started.elapsed().as_micros() as u64;
        *self.last_activity.lock() = Instant::now();

        let outcome = match result {
            Ok(result) => {
                self.stats.record_completion(execution_time_us);
                self.context.stats.record_completion(self.queue_type, execution_time_us);
                log::trace!(
                    "{}: query {} completed in {}us",
                    self.label(),
                    query.query_id,
                    execution_time_us
                );
                QueryOutcome {
                    query_id: query.query_id.clone(),
                    queue_type: self.queue_type,
                    success: true,
                    timed_out: false,
                    row_count: result.row_count,
                    affected_rows: result.affected_rows,
                    data_json: result.data_json,
                    error_message: None,
                    execution_time_us,
                }
            }
            Err(e) => {
                let timed_out = e.is_timeout();
                self.stats.record_failure(timed_out);
                self.context.stats.record_failure(self.queue_type);
                if timed_out {
                    self.context.stats.record_timeout(self.queue_type);
                }
                log::warn!("{}: query {} failed: {}", self.label(), query.query_id, e);

                let mut outcome = QueryOutcome::failed(&query.query_id, self.queue_type, e.to_string());
                outcome.timed_out = timed_out;
                outcome.execution_time_us = execution_time_us;
                outcome
            }
        };

        query.finish(outcome);
    }

    fn run_query(&self, query: &DatabaseQuery) -> Result<QueryResult, QueueError> {
        let mut conn = self.connection.lock();
        while conn.lease.is_some() {
            if self.is_shutdown_requested() {
                return Err(QueueError::ShuttingDown(self.label()));
            }
            self.connection_released
                .wait_for(&mut conn, self.context.config.worker_wait());
        }

        let (connector, handle) = match (conn.connector.clone(), conn.handle) {
            (Some(connector), Some(handle)) => (connector, handle),
            _ => return Err(QueueError::NotConnected),
        };

        let name = query.resolved_statement_name();
        let cache_size = self.context.config.prepared_statement_cache_size;
        let statements = conn
            .statements
            .get_or_insert_with(|| StatementCache::new(cache_size));
        let statement = statements.prepare(connector.as_ref(), handle, &name, &query.query_template)?;

        if let Err(e) = self.statement_names.add(&name) {
            log::warn!("{}: could not record statement {}: {}", self.label(), name, e);
        }

        let request = QueryRequest {
            query_id: query.query_id.clone(),
            sql: query.query_template.clone(),
            parameters_json: query.parameter_json.clone(),
            timeout_seconds: self.context.config.query_timeout_seconds,
        };
        Ok(connector.execute_prepared(handle, statement, &request)?)
    }

    /// Release one prepared statement on this queue's connection
    pub fn unprepare_statement(&self, name: &str) -> bool {
        let mut conn = self.connection.lock();
        let (connector, handle) = match (conn.connector.clone(), conn.handle) {
            (Some(connector), Some(handle)) => (connector, handle),
            _ => return false,
        };
        let released = conn
            .statements
            .as_mut()
            .map(|statements| statements.unprepare(connector.as_ref(), handle, name))
            .unwrap_or(false);
        if released {
            self.statement_names.remove(name);
        }
        released
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// False once shutdown was requested. Warns when the backlog is deep.
    pub fn health_check(&self) -> bool {
        if self.is_shutdown_requested() {
            return false;
        }

        let depth = self.depth();
        if depth > DEPTH_WARNING_THRESHOLD {
            log::warn!("{}: queue depth {} exceeds {}", self.label(), depth, DEPTH_WARNING_THRESHOLD);
        }
        true
    }

    /// One-line human-readable status
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Database {} [{}] - Active: {}, Connected: {}, Depth: {}, Children: {}, Submitted: {}, Completed: {}, Failed: {}",
            self.database_name,
            self.queue_type,
            if self.is_shutdown_requested() { "NO" } else { "YES" },
            if self.is_connected() { "YES" } else { "NO" },
            self.depth(),
            self.child_queue_count(),
            stats.submitted,
            stats.completed,
            stats.failed,
        )
    }

    /// Status document for this queue and its children
    pub fn stats_json(&self) -> serde_json::Value {
        let children: Vec<serde_json::Value> = self
            .child_queues()
            .iter()
            .map(|child| child.stats_json())
            .collect();

        json!({
            "database": self.database_name,
            "label": self.label(),
            "queue_type": self.queue_type.as_str(),
            "queue_number": self.queue_number,
            "state": self.state(),
            "connected": self.is_connected(),
            "depth": self.pending_len(),
            "prepared_statements": self.prepared_statement_count(),
            "stats": self.stats(),
            "child_queues": children,
        })
    }

    /// Stop this queue: shut down children, join the thread, release the
    /// connection and fail whatever is still pending. Idempotent.
    pub fn shutdown(&self) {
        let Some(dropped) = self.stop() else {
            return;
        };
        if !dropped.is_empty() {
            log::warn!("{}: dropping {} pending queries", self.label(), dropped.len());
        }
        for query in dropped {
            self.fail_unexecuted(query);
        }
        self.advance_state(QueueState::Destroyed);
        log::debug!("{}: destroyed", self.label());
    }

    /// Stop a child the Lead no longer needs. Queries it had not started
    /// yet are returned instead of failed.
    pub(crate) fn retire(&self) -> Vec<DatabaseQuery> {
        let Some(leftover) = self.stop() else {
            return Vec::new();
        };
        self.advance_state(QueueState::Destroyed);
        log::debug!("{}: retired with {} pending queries", self.label(), leftover.len());
        leftover
    }

    /// Fail a query that never reached the engine
    pub(crate) fn fail_unexecuted(&self, query: DatabaseQuery) {
        let query_id = query.query_id.clone();
        query.finish(QueryOutcome::failed(
            &query_id,
            self.queue_type,
            "queue shut down before execution",
        ));
    }

    /// Shut down children, join the thread and release the connection.
    /// Returns the queries still pending, or `None` if already stopped.
    fn stop(&self) -> Option<Vec<DatabaseQuery>> {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.advance_state(QueueState::ShuttingDown);
        log::info!("{}: shutting down", self.label());

        let children: Vec<Arc<DatabaseQueue>> = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.shutdown();
        }

        self.work_signal.post();
        self.connection_released.notify_all();
        self.initial_connection_cond.notify_all();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                log::debug!("{}: shutdown requested from its own thread", self.label());
            } else if handle.join().is_err() {
                log::error!("{}: worker thread panicked", self.label());
            }
        }

        self.disconnect();

        Some(self.pending.lock().drain(..).collect())
    }
}
