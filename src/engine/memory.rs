//! In-Memory Engine Connector
//!
//! A deterministic connector that keeps no data but tracks every call.
//! Used for dry runs and for exercising the queue core without a real
//! database. Failures and timeouts can be injected per statement.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use parking_lot::Mutex;
use serde_json::json;

use super::{
    ConnectionConfig, ConnectionHandle, EngineConnector, EngineError, EngineKind, QueryRequest,
    QueryResult, StatementHandle,
};

/// Number of calls made to each connector entry point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: u64,
    pub prepare: u64,
    pub execute: u64,
    pub unprepare: u64,
    pub health_check: u64,
    pub disconnect: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_connection: u64,
    next_statement: u64,
    open_connections: HashSet<u64>,
    // statement handle -> (connection, statement name)
    statements: HashMap<u64, (u64, String)>,
    executed: Vec<String>,
    calls: CallCounts,

    fail_connect: bool,
    unhealthy: bool,
    fail_prepare: HashSet<String>,
    fail_execute: HashSet<String>,
    timeout_execute: HashSet<String>,
    execute_delay: Duration,
}

/// Connector that simulates an engine in process
pub struct MemoryConnector {
    kind: EngineKind,
    state: Mutex<MemoryState>,
}

impl MemoryConnector {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MemoryState {
                next_connection: 1,
                next_statement: 1,
                ..Default::default()
            }),
        }
    }

    /// Make the next statement handles start at `first`
    pub fn with_statement_handles(self, first: u64) -> Self {
        self.state.lock().next_statement = first;
        self
    }

    /// Make every connect attempt fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Make health probes report the connection as dead
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.state.lock().unhealthy = unhealthy;
    }

    /// Fail `prepare` for the given statement name
    pub fn fail_prepare_for(&self, name: &str) {
        self.state.lock().fail_prepare.insert(name.to_string());
    }

    /// Fail execution of the given SQL
    pub fn fail_execute_for(&self, sql: &str) {
        self.state.lock().fail_execute.insert(sql.to_string());
    }

    /// Report a timeout when executing the given SQL
    pub fn time_out_for(&self, sql: &str) {
        self.state.lock().timeout_execute.insert(sql.to_string());
    }

    /// Sleep this long inside every execution
    pub fn set_execute_delay(&self, delay: Duration) {
        self.state.lock().execute_delay = delay;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }

    /// Query ids in the order they were executed
    pub fn executed_queries(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections.len()
    }

    /// Statements prepared and not yet released
    pub fn live_statements(&self) -> usize {
        self.state.lock().statements.len()
    }

    /// Names of live statements on a connection, sorted
    pub fn live_statement_names(&self, connection: ConnectionHandle) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .statements
            .values()
            .filter(|(conn, _)| *conn == connection.raw())
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl EngineConnector for MemoryConnector {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, EngineError> {
        let mut state = self.state.lock();
        state.calls.connect += 1;

        if state.fail_connect {
            return Err(EngineError::Connect(format!(
                "simulated connect failure for {}",
                config.masked()
            )));
        }

        let raw = state.next_connection;
        state.next_connection += 1;
        state.open_connections.insert(raw);
        Ok(ConnectionHandle::new(self.kind, raw))
    }

    fn prepare(
        &self,
        connection: ConnectionHandle,
        name: &str,
        _sql: &str,
    ) -> Result<StatementHandle, EngineError> {
        let mut state = self.state.lock();
        state.calls.prepare += 1;

        if !state.open_connections.contains(&connection.raw()) {
            return Err(EngineError::Prepare {
                name: name.to_string(),
                reason: "connection is closed".to_string(),
            });
        }
        if state.fail_prepare.contains(name) {
            return Err(EngineError::Prepare {
                name: name.to_string(),
                reason: "simulated prepare failure".to_string(),
            });
        }

        let raw = state.next_statement;
        state.next_statement += 1;
        state.statements.insert(raw, (connection.raw(), name.to_string()));
        Ok(StatementHandle::new(raw))
    }

    fn execute_prepared(
        &self,
        connection: ConnectionHandle,
        statement: StatementHandle,
        request: &QueryRequest,
    ) -> Result<QueryResult, EngineError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.execute += 1;
            state.execute_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if !state.open_connections.contains(&connection.raw()) {
            return Err(EngineError::Execute("connection is closed".to_string()));
        }
        let name = match state.statements.get(&statement.raw()) {
            Some((_, name)) => name.clone(),
            None => return Err(EngineError::Execute("unknown statement handle".to_string())),
        };
        if state.timeout_execute.contains(&request.sql) {
            return Err(EngineError::Timeout(request.timeout_seconds));
        }
        if state.fail_execute.contains(&request.sql) {
            return Err(EngineError::Execute(format!(
                "simulated failure for query {}",
                request.query_id
            )));
        }

        state.executed.push(request.query_id.clone());
        let data = json!([{ "statement": name, "query_id": request.query_id }]);
        Ok(QueryResult {
            data_json: Some(data.to_string()),
            row_count: 1,
            column_count: 2,
            affected_rows: 0,
        })
    }

    fn unprepare(&self, _connection: ConnectionHandle, statement: StatementHandle) {
        let mut state = self.state.lock();
        state.calls.unprepare += 1;
        state.statements.remove(&statement.raw());
    }

    fn health_check(&self, connection: ConnectionHandle) -> bool {
        let mut state = self.state.lock();
        state.calls.health_check += 1;
        !state.unhealthy && state.open_connections.contains(&connection.raw())
    }

    fn disconnect(&self, connection: ConnectionHandle) {
        let mut state = self.state.lock();
        state.calls.disconnect += 1;
        state.open_connections.remove(&connection.raw());
        state.statements.retain(|_, (conn, _)| *conn != connection.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sql: &str) -> QueryRequest {
        QueryRequest {
            query_id: "q1".to_string(),
            sql: sql.to_string(),
            parameters_json: "{}".to_string(),
            timeout_seconds: 5,
        }
    }

    #[test]
    fn test_connect_prepare_execute() {
        let connector = MemoryConnector::new(EngineKind::Sqlite).with_statement_handles(0x1111);
        let config = ConnectionConfig::parse("sqlite:///tmp/mem.db").unwrap();

        let conn = connector.connect(&config).unwrap();
        let stmt = connector.prepare(conn, "stmt_1", "SELECT 1").unwrap();
        assert_eq!(stmt.raw(), 0x1111);

        let result = connector.execute_prepared(conn, stmt, &request("SELECT 1")).unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.data_json.unwrap().contains("stmt_1"));
        assert_eq!(connector.executed_queries(), vec!["q1".to_string()]);

        connector.disconnect(conn);
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(connector.live_statements(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let connector = MemoryConnector::new(EngineKind::PostgreSql);
        let config = ConnectionConfig::parse("postgresql://u:p@localhost/db").unwrap();

        connector.set_fail_connect(true);
        assert!(matches!(connector.connect(&config), Err(EngineError::Connect(_))));
        connector.set_fail_connect(false);

        let conn = connector.connect(&config).unwrap();
        connector.fail_prepare_for("bad");
        assert!(connector.prepare(conn, "bad", "SELECT 1").is_err());

        let stmt = connector.prepare(conn, "good", "SELECT 2").unwrap();
        connector.time_out_for("SELECT 2");
        assert_eq!(
            connector.execute_prepared(conn, stmt, &request("SELECT 2")),
            Err(EngineError::Timeout(5))
        );

        assert!(connector.health_check(conn));
        connector.set_unhealthy(true);
        assert!(!connector.health_check(conn));

        let calls = connector.calls();
        assert_eq!(calls.connect, 2);
        assert_eq!(calls.prepare, 2);
        assert_eq!(calls.health_check, 2);
    }
}
