//! Connection Management and Heartbeat
//!
//! Connect, bootstrap, health probe, reconnect and teardown of a queue's
//! persistent connection. Everything here runs with the connection lock
//! held, so the statement cache is always created and destroyed together
//! with the handle it belongs to.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::database::{derive_statement_name, StatementCache};
use crate::engine::{ConnectionConfig, QueryRequest};
use super::database_queue::ConnectionState;
use super::{DatabaseQueue, QueueError, QueueState};

impl DatabaseQueue {
    pub(crate) fn heartbeat_due(&self) -> bool {
        match self.timers.lock().last_heartbeat {
            Some(last) => last.elapsed() >= self.heartbeat_interval(),
            None => true,
        }
    }

    /// Run one heartbeat: probe the connection, reconnect if it is gone,
    /// and on a Lead re-evaluate the child queues.
    pub fn perform_heartbeat(&self) {
        self.timers.lock().last_heartbeat = Some(Instant::now());
        if self.is_shutdown_requested() {
            return;
        }

        {
            let mut conn = self.connection.lock();
            if conn.lease.is_some() {
                log::trace!("{}: connection lent to migration, skipping probe", self.label());
            } else {
                match (conn.connector.clone(), conn.handle) {
                    (Some(connector), Some(handle)) => {
                        if !connector.health_check(handle) {
                            log::warn!("{}: health check failed, reconnecting", self.label());
                            self.teardown_locked(&mut conn);
                            self.connect_locked(&mut conn);
                        }
                    }
                    _ => {
                        self.connect_locked(&mut conn);
                    }
                }
            }
        }

        if self.is_lead_queue() {
            self.manage_child_queues();
        }
    }

    /// Connect if not connected. Returns whether a connection is up.
    pub fn check_connection(&self) -> bool {
        let mut conn = self.connection.lock();
        if conn.handle.is_none() {
            self.connect_locked(&mut conn);
        }
        conn.handle.is_some()
    }

    /// First connection attempt made by the queue thread
    pub(crate) fn initial_connect(&self) {
        {
            let mut conn = self.connection.lock();
            if conn.handle.is_none() {
                self.connect_locked(&mut conn);
            }
        }
        self.timers.lock().last_heartbeat = Some(Instant::now());

        let mut done = self.initial_connection.lock();
        *done = true;
        self.initial_connection_cond.notify_all();
    }

    /// Wait until the Lead's first connection attempt has finished.
    ///
    /// Returns whether the Lead ended up connected. Workers never wait.
    pub fn wait_for_initial_connection(&self, timeout: Duration) -> bool {
        if !self.is_lead_queue() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut done = self.initial_connection.lock();
        while !*done && !self.is_shutdown_requested() {
            if self
                .initial_connection_cond
                .wait_until(&mut done, deadline)
                .timed_out()
            {
                break;
            }
        }
        *done && self.is_connected()
    }

    /// Release the connection and its prepared statements
    pub fn disconnect(&self) {
        let mut conn = self.connection.lock();
        self.teardown_locked(&mut conn);
    }

    pub(crate) fn connect_locked(&self, conn: &mut ConnectionState) -> bool {
        self.timers.lock().last_connection_attempt = Some(Instant::now());
        self.initial_connection_attempted.store(true, Ordering::SeqCst);
        self.advance_state(QueueState::Connecting);

        let settings = &self.context.config;
        let config = match ConnectionConfig::parse(&self.connection_string) {
            Ok(config) => config
                .with_timeout(settings.connect_timeout_seconds)
                .with_cache_size(settings.prepared_statement_cache_size),
            Err(e) => {
                log::error!("{}: {}", self.label(), e);
                return false;
            }
        };

        let connector = match self.context.engines.resolve(config.engine) {
            Ok(connector) => connector,
            Err(e) => {
                log::error!("{}: cannot connect to {}: {}", self.label(), config.masked(), e);
                return false;
            }
        };

        match connector.connect(&config) {
            Ok(handle) => {
                conn.statements = Some(StatementCache::new(config.prepared_statement_cache_size));
                conn.handle = Some(handle);
                conn.connector = Some(connector);
                self.is_connected.store(true, Ordering::SeqCst);
                log::info!("{}: connected to {}", self.label(), config.masked());

                if self.is_lead_queue() {
                    self.run_bootstrap(conn);
                    self.advance_state(QueueState::Bootstrapped);
                } else {
                    self.advance_state(QueueState::Running);
                }
                true
            }
            Err(e) => {
                self.is_connected.store(false, Ordering::SeqCst);
                log::warn!("{}: connection to {} failed: {}", self.label(), config.masked(), e);
                false
            }
        }
    }

    // Runs until it succeeds once; a failure is retried on the next connection.
    fn run_bootstrap(&self, conn: &mut ConnectionState) {
        if self.bootstrap_completed() {
            return;
        }
        let Some(sql) = self.bootstrap_query.as_deref() else {
            return;
        };
        if sql.is_empty() {
            self.bootstrap_completed.store(true, Ordering::SeqCst);
            log::debug!("{}: empty bootstrap query, nothing to run", self.label());
            return;
        }

        let (Some(connector), Some(handle)) = (conn.connector.clone(), conn.handle) else {
            return;
        };

        let cache_size = self.context.config.prepared_statement_cache_size;
        let statements = conn
            .statements
            .get_or_insert_with(|| StatementCache::new(cache_size));
        let request = QueryRequest {
            query_id: "bootstrap".to_string(),
            sql: sql.to_string(),
            parameters_json: "{}".to_string(),
            timeout_seconds: self.context.config.query_timeout_seconds,
        };

        let result = statements
            .prepare(connector.as_ref(), handle, &derive_statement_name(sql), sql)
            .map_err(QueueError::from)
            .and_then(|statement| {
                connector
                    .execute_prepared(handle, statement, &request)
                    .map_err(QueueError::from)
            });

        match result {
            Ok(result) => {
                self.bootstrap_completed.store(true, Ordering::SeqCst);
                log::info!("{}: bootstrap query completed ({} rows)", self.label(), result.row_count);
            }
            Err(e) => {
                log::error!("{}: bootstrap query failed: {}", self.label(), e);
            }
        }
    }

    pub(crate) fn teardown_locked(&self, conn: &mut ConnectionState) {
        let statements = conn.statements.take();
        if let (Some(connector), Some(handle)) = (conn.connector.take(), conn.handle.take()) {
            if let Some(mut statements) = statements {
                statements.clear(connector.as_ref(), handle);
            }
            connector.disconnect(handle);
            log::info!("{}: disconnected", self.label());
        }

        if conn.lease.take().is_some() {
            self.connection_released.notify_all();
        }
        self.is_connected.store(false, Ordering::SeqCst);
    }
}
