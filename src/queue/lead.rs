//! Lead Queue Operations
//!
//! Child queue lifecycle, the child capacity policy evaluated on every
//! Lead heartbeat, query routing, and lending the Lead's connection to
//! the migration runner.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ChildPolicy;
use crate::database::DatabaseQuery;
use crate::engine::{ConnectionHandle, EngineConnector};
use super::{DatabaseQueue, QueueError, QueueState, QueueType, Rejected};

impl DatabaseQueue {
    /// Start-up sequence of the Lead's thread: connect, bootstrap, then
    /// launch the configured children.
    pub(crate) fn run_conductor(&self) {
        self.initial_connect();
        self.launch_additional_queues();
        self.advance_state(QueueState::Running);
        log::info!(
            "{}: running with {} child queues",
            self.label(),
            self.child_queue_count()
        );
    }

    pub fn child_policy(&self) -> ChildPolicy {
        self.child_policy.lock().clone()
    }

    pub fn set_child_policy(&self, policy: ChildPolicy) {
        *self.child_policy.lock() = policy;
    }

    /// Spawn, start and register a Worker child.
    ///
    /// Fails when the child limit is reached or a child of that type
    /// already exists.
    pub fn spawn_child_queue(&self, queue_type: QueueType) -> Result<Arc<DatabaseQueue>, QueueError> {
        if !self.can_spawn_queues() {
            return Err(QueueError::NotLead("spawn child queues"));
        }
        if !queue_type.is_worker() {
            return Err(QueueError::LeadAsWorker);
        }
        let max_children = self.context.config.max_child_queues;
        let mut children = self.children.lock();
        // Checked under the lock so `shutdown` cannot miss a new child
        if self.is_shutdown_requested() {
            return Err(QueueError::ShuttingDown(self.label()));
        }
        if children.len() >= max_children {
            return Err(QueueError::ChildLimitReached(max_children));
        }
        if children.iter().any(|child| child.queue_type == queue_type) {
            return Err(QueueError::DuplicateChild(queue_type));
        }

        let queue_number = (1..)
            .find(|n| children.iter().all(|child| child.queue_number != *n))
            .unwrap_or(children.len() + 1);
        let child = self.create_child(queue_type, queue_number)?;
        child.start_worker()?;
        children.push(Arc::clone(&child));

        log::info!("{}: spawned child queue {}", self.label(), child.label());
        Ok(child)
    }

    /// Stop and remove the child of `queue_type`. Queries it had not yet
    /// started move to this queue. Returns false if there is no such child.
    pub fn shutdown_child_queue(&self, queue_type: QueueType) -> bool {
        let child = {
            let mut children = self.children.lock();
            match children.iter().position(|child| child.queue_type == queue_type) {
                Some(index) => children.remove(index),
                None => return false,
            }
        };

        log::info!("{}: shutting down child queue {}", self.label(), child.label());
        let leftover = child.retire();
        if !leftover.is_empty() {
            log::info!(
                "{}: taking over {} queries from {}",
                self.label(),
                leftover.len(),
                child.label()
            );
        }
        for query in leftover {
            if let Err(rejected) = self.requeue(query) {
                self.fail_unexecuted(rejected.into_query());
            }
        }
        true
    }

    pub fn child_queue_count(&self) -> usize {
        self.children.lock().len()
    }

    pub fn child_queue(&self, queue_type: QueueType) -> Option<Arc<DatabaseQueue>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.queue_type == queue_type)
            .cloned()
    }

    pub fn child_queues(&self) -> Vec<Arc<DatabaseQueue>> {
        self.children.lock().clone()
    }

    /// Spawn every `start` type of the child policy that is not running
    pub(crate) fn launch_additional_queues(&self) {
        let policy = self.child_policy();
        for queue_type in policy.start {
            if self.child_queue(queue_type).is_some() {
                continue;
            }
            if let Err(e) = self.spawn_child_queue(queue_type) {
                log::warn!("{}: could not start {} queue: {}", self.label(), queue_type, e);
            }
        }
    }

    /// Apply the child policy: restore missing `start` children, spawn
    /// on-demand children for backlogged types, retire idle on-demand ones.
    pub fn manage_child_queues(&self) {
        if !self.can_spawn_queues() || self.is_shutdown_requested() {
            return;
        }
        let policy = self.child_policy();

        for queue_type in &policy.start {
            if self.child_queue(*queue_type).is_none() {
                log::info!("{}: restoring {} queue", self.label(), queue_type);
                if let Err(e) = self.spawn_child_queue(*queue_type) {
                    log::warn!("{}: could not restore {} queue: {}", self.label(), queue_type, e);
                }
            }
        }

        if policy.scale_up_depth > 0 {
            for queue_type in QueueType::WORKERS {
                if self.child_queue(queue_type).is_some() {
                    continue;
                }
                let backlog = self.pending_for(queue_type);
                if backlog < policy.scale_up_depth {
                    continue;
                }
                match self.spawn_child_queue(queue_type) {
                    Ok(child) => log::info!(
                        "{}: backlog of {} {} queries, spawned {}",
                        self.label(),
                        backlog,
                        queue_type,
                        child.label()
                    ),
                    Err(e) => log::debug!("{}: no {} queue spawned: {}", self.label(), queue_type, e),
                }
            }
        }

        if policy.idle_retire_seconds > 0 {
            let idle_limit = Duration::from_secs(policy.idle_retire_seconds);
            for child in self.child_queues() {
                if policy.start.contains(&child.queue_type) {
                    continue;
                }
                if child.pending_len() == 0 && child.idle_for() >= idle_limit {
                    log::info!("{}: retiring idle queue {}", self.label(), child.label());
                    self.shutdown_child_queue(child.queue_type);
                }
            }
        }
    }

    /// Hand a query to the child matching its hint, or keep it on this
    /// queue when no such child exists. Returns the type of the queue
    /// that accepted it.
    pub fn route(&self, query: DatabaseQuery) -> Result<QueueType, Rejected> {
        if self.is_lead_queue() && query.queue_type_hint.is_worker() {
            if let Some(child) = self.child_queue(query.queue_type_hint) {
                return match child.submit(query) {
                    Ok(()) => Ok(child.queue_type),
                    // Child is being retired; the Lead takes it instead
                    Err(rejected) if matches!(rejected.reason, QueueError::ShuttingDown(_)) => {
                        self.submit(rejected.into_query()).map(|()| self.queue_type)
                    }
                    Err(rejected) => Err(rejected),
                };
            }
        }

        self.submit(query).map(|()| self.queue_type)
    }

    /// Lend the Lead's connection to the migration runner.
    ///
    /// Blocks while another lease is out. The queue's own thread does not
    /// use the connection until the lease is released.
    pub fn acquire_migration_connection(&self) -> Result<MigrationLease<'_>, QueueError> {
        if !self.is_lead_queue() {
            return Err(QueueError::NotLead("lend its connection for migrations"));
        }

        let mut conn = self.connection.lock();
        while conn.lease.is_some() {
            if self.is_shutdown_requested() {
                return Err(QueueError::ShuttingDown(self.label()));
            }
            self.connection_released
                .wait_for(&mut conn, self.context.config.worker_wait());
        }
        if self.is_shutdown_requested() {
            return Err(QueueError::ShuttingDown(self.label()));
        }

        let (connector, handle) = match (conn.connector.clone(), conn.handle) {
            (Some(connector), Some(handle)) => (connector, handle),
            _ => return Err(QueueError::NotConnected),
        };

        conn.next_lease += 1;
        let id = conn.next_lease;
        conn.lease = Some(id);
        log::debug!("{}: migration connection acquired", self.label());

        Ok(MigrationLease {
            queue: self,
            id,
            handle,
            connector,
        })
    }

    /// Return the migration connection. Safe to call when nothing is lent.
    pub fn release_migration_connection(&self) {
        let mut conn = self.connection.lock();
        if conn.lease.take().is_some() {
            self.connection_released.notify_all();
            log::debug!("{}: migration connection released", self.label());
        }
    }

    /// Whether the connection is currently lent out
    pub fn migration_connection_in_use(&self) -> bool {
        self.connection.lock().lease.is_some()
    }

    fn release_lease(&self, id: u64) {
        let mut conn = self.connection.lock();
        if conn.lease == Some(id) {
            conn.lease = None;
            self.connection_released.notify_all();
            log::debug!("{}: migration connection released", self.label());
        }
    }
}

/// Exclusive use of a Lead's connection. Released on drop.
pub struct MigrationLease<'a> {
    queue: &'a DatabaseQueue,
    id: u64,
    handle: ConnectionHandle,
    connector: Arc<dyn EngineConnector>,
}

impl MigrationLease<'_> {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn connector(&self) -> &dyn EngineConnector {
        self.connector.as_ref()
    }

    /// Label of the lending queue, for migration logs
    pub fn label(&self) -> String {
        self.queue.label()
    }

    pub fn release(self) {}
}

impl Drop for MigrationLease<'_> {
    fn drop(&mut self) {
        self.queue.release_lease(self.id);
    }
}

impl fmt::Debug for MigrationLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationLease")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use crate::config::QueueConfig;
    use crate::engine::QueryRequest;
    use crate::queue::testing::{memory_context, wait_until};
    use super::*;

    fn lead_with(config: QueueConfig) -> (Arc<DatabaseQueue>, Arc<crate::engine::MemoryConnector>) {
        let (context, connector) = memory_context(config);
        let lead = DatabaseQueue::create_lead("testdb", "sqlite:///tmp/lead.db", None, context).unwrap();
        (lead, connector)
    }

    #[test]
    fn test_spawn_child_is_unique_per_type() {
        let (lead, _) = lead_with(QueueConfig::default());

        let fast = lead.spawn_child_queue(QueueType::Fast).unwrap();
        assert_eq!(fast.queue_number(), 1);
        assert_eq!(fast.label(), "DQM-testdb-01-F");
        assert!(matches!(
            lead.spawn_child_queue(QueueType::Fast),
            Err(QueueError::DuplicateChild(QueueType::Fast))
        ));
        assert_eq!(lead.child_queue_count(), 1);

        lead.shutdown();
        assert!(fast.is_shutdown_requested());
    }

    #[test]
    fn test_spawn_child_respects_limit() {
        let (lead, _) = lead_with(QueueConfig {
            max_child_queues: 2,
            ..Default::default()
        });

        lead.spawn_child_queue(QueueType::Slow).unwrap();
        lead.spawn_child_queue(QueueType::Medium).unwrap();
        assert!(matches!(
            lead.spawn_child_queue(QueueType::Cache),
            Err(QueueError::ChildLimitReached(2))
        ));
        assert!(matches!(
            lead.spawn_child_queue(QueueType::Lead),
            Err(QueueError::LeadAsWorker)
        ));
        assert_eq!(lead.child_queue_count(), 2);
        lead.shutdown();
    }

    #[test]
    fn test_workers_cannot_spawn() {
        let (context, _) = memory_context(QueueConfig::default());
        let worker = DatabaseQueue::create_worker("db", "db.db", QueueType::Slow, None, context).unwrap();
        assert!(matches!(
            worker.spawn_child_queue(QueueType::Fast),
            Err(QueueError::NotLead(_))
        ));
        assert!(matches!(
            worker.acquire_migration_connection(),
            Err(QueueError::NotLead(_))
        ));
    }

    #[test]
    fn test_shutdown_child_queue() {
        let (lead, _) = lead_with(QueueConfig::default());
        let fast = lead.spawn_child_queue(QueueType::Fast).unwrap();

        assert!(lead.shutdown_child_queue(QueueType::Fast));
        assert_eq!(lead.child_queue_count(), 0);
        assert_eq!(fast.state(), QueueState::Destroyed);

        assert!(!lead.shutdown_child_queue(QueueType::Fast));
        assert!(!lead.shutdown_child_queue(QueueType::Cache));
        lead.shutdown();
    }

    #[test]
    fn test_retired_child_hands_pending_queries_to_lead() {
        let (lead, connector) = lead_with(QueueConfig::default());
        assert!(lead.check_connection());
        let cache = lead.spawn_child_queue(QueueType::Cache).unwrap();

        // Accepted by the child just before retirement, never picked up
        let (query, rx) = DatabaseQuery::new("late", "SELECT 1", "{}", QueueType::Cache).with_reply();
        cache.pending.lock().push_back(query);

        assert!(lead.shutdown_child_queue(QueueType::Cache));
        assert_eq!(cache.state(), QueueState::Destroyed);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(lead.pending_len(), 1);

        assert!(lead.process_next());
        let outcome = tokio_test::block_on(rx).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.queue_type, QueueType::Lead);
        assert_eq!(connector.executed_queries(), vec!["late"]);
        lead.shutdown();
    }

    #[test]
    fn test_child_numbers_reuse_free_slots() {
        let (lead, _) = lead_with(QueueConfig::default());
        lead.spawn_child_queue(QueueType::Slow).unwrap();
        lead.spawn_child_queue(QueueType::Fast).unwrap();
        assert!(lead.shutdown_child_queue(QueueType::Slow));

        let cache = lead.spawn_child_queue(QueueType::Cache).unwrap();
        assert_eq!(cache.queue_number(), 1);
        lead.shutdown();
    }

    #[test]
    fn test_route_prefers_matching_child() {
        let (lead, connector) = lead_with(QueueConfig::default());
        assert!(lead.check_connection());

        let accepted = lead
            .route(DatabaseQuery::new("early", "SELECT 1", "{}", QueueType::Fast))
            .unwrap();
        assert_eq!(accepted, QueueType::Lead);
        assert_eq!(lead.pending_len(), 1);

        let fast = lead.spawn_child_queue(QueueType::Fast).unwrap();
        let (query, rx) = DatabaseQuery::new("late", "SELECT 2", "{}", QueueType::Fast).with_reply();
        assert_eq!(lead.route(query).unwrap(), QueueType::Fast);

        let outcome = tokio_test::block_on(rx).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.queue_type, QueueType::Fast);
        assert_eq!(fast.stats().completed, 1);

        // Queries without a matching child stay on the Lead
        assert_eq!(
            lead.route(DatabaseQuery::new("s", "SELECT 3", "{}", QueueType::Slow)).unwrap(),
            QueueType::Lead
        );
        assert_eq!(lead.depth(), 2);
        assert!(connector.executed_queries().contains(&"late".to_string()));
        lead.shutdown();
    }

    #[test]
    fn test_conductor_launches_start_children() {
        let mut config = QueueConfig::default();
        config.child_policy.start = vec![QueueType::Fast, QueueType::Cache];
        let (lead, _) = lead_with(config);

        lead.start_worker().unwrap();
        assert!(wait_until(|| lead.state() == QueueState::Running));
        assert_eq!(lead.child_queue_count(), 2);
        assert!(lead.child_queue(QueueType::Fast).is_some());
        assert!(lead.child_queue(QueueType::Cache).is_some());

        lead.shutdown();
        assert_eq!(lead.child_queue_count(), 0);
    }

    #[test]
    fn test_manage_restores_start_children() {
        let mut config = QueueConfig::default();
        config.child_policy.start = vec![QueueType::Slow];
        let (lead, _) = lead_with(config);

        lead.manage_child_queues();
        assert!(lead.child_queue(QueueType::Slow).is_some());

        assert!(lead.shutdown_child_queue(QueueType::Slow));
        lead.perform_heartbeat();
        assert!(lead.child_queue(QueueType::Slow).is_some());
        lead.shutdown();
    }

    #[test]
    fn test_manage_scales_up_on_backlog_and_retires_idle() {
        let mut config = QueueConfig::default();
        config.child_policy.scale_up_depth = 3;
        config.child_policy.idle_retire_seconds = 0;
        let (lead, _) = lead_with(config);

        for i in 0..2 {
            lead.route(DatabaseQuery::new(format!("c{}", i), "SELECT 1", "{}", QueueType::Cache))
                .unwrap();
        }
        lead.manage_child_queues();
        assert!(lead.child_queue(QueueType::Cache).is_none());

        lead.route(DatabaseQuery::new("c2", "SELECT 1", "{}", QueueType::Cache)).unwrap();
        lead.manage_child_queues();
        assert!(lead.child_queue(QueueType::Cache).is_some());

        lead.set_child_policy(ChildPolicy {
            start: Vec::new(),
            scale_up_depth: 0,
            idle_retire_seconds: 1,
        });
        let cache = lead.child_queue(QueueType::Cache).unwrap();
        thread::sleep(Duration::from_millis(1100));
        assert!(cache.idle_for() >= Duration::from_secs(1));
        lead.manage_child_queues();
        assert!(lead.child_queue(QueueType::Cache).is_none());
        lead.shutdown();
    }

    #[test]
    fn test_migration_lease_round_trip() {
        let (lead, _) = lead_with(QueueConfig::default());
        assert!(matches!(
            lead.acquire_migration_connection(),
            Err(QueueError::NotConnected)
        ));
        assert!(lead.check_connection());

        // Releasing with nothing lent is harmless
        lead.release_migration_connection();
        lead.release_migration_connection();

        let lease = lead.acquire_migration_connection().unwrap();
        assert!(lead.migration_connection_in_use());
        assert_eq!(lease.label(), "DQM-testdb-00-SMFC");
        let statement = lease.connector().prepare(lease.handle(), "migrate_1", "CREATE TABLE t (id INT)").unwrap();
        let request = QueryRequest {
            query_id: "migration".to_string(),
            sql: "CREATE TABLE t (id INT)".to_string(),
            parameters_json: "{}".to_string(),
            timeout_seconds: 5,
        };
        assert!(lease.connector().execute_prepared(lease.handle(), statement, &request).is_ok());

        lead.release_migration_connection();
        assert!(!lead.migration_connection_in_use());

        // Lockable again by someone else; the stale lease must not release it
        let second = lead.acquire_migration_connection().unwrap();
        drop(lease);
        assert!(lead.migration_connection_in_use());
        second.release();
        assert!(!lead.migration_connection_in_use());
        lead.shutdown();
    }

    #[test]
    fn test_lease_blocks_query_execution_until_released() {
        let (lead, _) = lead_with(QueueConfig::default());
        assert!(lead.check_connection());

        let lease = lead.acquire_migration_connection().unwrap();
        let (query, rx) = DatabaseQuery::new("q", "SELECT 1", "{}", QueueType::Medium).with_reply();
        lead.submit(query).unwrap();

        let runner = {
            let lead = Arc::clone(&lead);
            thread::spawn(move || lead.process_next())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!runner.is_finished());

        let released_at = Instant::now();
        drop(lease);
        assert!(runner.join().unwrap());
        assert!(released_at.elapsed() < Duration::from_secs(1));
        assert!(tokio_test::block_on(rx).unwrap().success);
        lead.shutdown();
    }
}
