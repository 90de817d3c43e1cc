//! Query Dispatch
//!
//! Thin entry point for callers: find the Lead for a database name and
//! let it route the query by its type hint.

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::database::{DatabaseQuery, QueryOutcome};
use crate::manager::DatabaseQueueManager;
use crate::queue::{QueueError, QueueType, Rejected};

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Rejected(#[from] Rejected),

    #[error("Query {0} was dropped without a result")]
    NoReply(String),
}

/// Routes submissions to the registered databases
#[derive(Clone)]
pub struct QueryDispatcher {
    manager: Arc<DatabaseQueueManager>,
}

impl QueryDispatcher {
    pub fn new(manager: Arc<DatabaseQueueManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<DatabaseQueueManager> {
        &self.manager
    }

    /// Enqueue `query` on `database`. Returns the type of the queue that
    /// accepted it; on rejection the query is handed back.
    pub fn submit(&self, database: &str, query: DatabaseQuery) -> Result<QueueType, Rejected> {
        let lead = match self.manager.get_database(database) {
            Some(lead) => lead,
            None => {
                log::debug!("Query {} for unknown database {}", query.query_id, database);
                return Err(Rejected::new(QueueError::UnknownDatabase(database.to_string()), query));
            }
        };

        let selected = query.queue_type_hint;
        let accepted = lead.route(query)?;
        self.manager.context().stats.increment_selection(selected);
        Ok(accepted)
    }

    /// Build a query from raw parts and enqueue it with a reply channel
    pub fn submit_sql(
        &self,
        database: &str,
        query_id: &str,
        sql: &str,
        parameters_json: &str,
        hint: Option<&str>,
    ) -> Result<(QueueType, oneshot::Receiver<QueryOutcome>), Rejected> {
        let (query, reply) = DatabaseQuery::with_hint_token(query_id, sql, parameters_json, hint).with_reply();
        let accepted = self.submit(database, query)?;
        Ok((accepted, reply))
    }

    /// Submit and wait for the outcome
    pub async fn execute(
        &self,
        database: &str,
        query_id: &str,
        sql: &str,
        parameters_json: &str,
        hint: Option<&str>,
    ) -> Result<QueryOutcome, DispatchError> {
        let (_, reply) = self.submit_sql(database, query_id, sql, parameters_json, hint)?;
        reply
            .await
            .map_err(|_| DispatchError::NoReply(query_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::engine::{EngineKind, EngineRegistry, MemoryConnector};

    fn dispatcher_with(names: &[&str]) -> (QueryDispatcher, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new(EngineKind::Sqlite));
        let registry = EngineRegistry::static_only();
        registry.register(connector.clone());
        let config = QueueConfig {
            worker_wait_millis: 20,
            ..Default::default()
        };
        let manager = Arc::new(DatabaseQueueManager::new(4, Arc::new(registry), Arc::new(config)));
        for name in names {
            let lead = manager.create_lead(name, &format!("sqlite:///tmp/{}.db", name), None).unwrap();
            manager.add_database(lead.clone()).unwrap();
            lead.start_worker().unwrap();
        }
        (QueryDispatcher::new(manager), connector)
    }

    #[test]
    fn test_unknown_database_is_rejected_without_counting() {
        let (dispatcher, _) = dispatcher_with(&["orders"]);
        let query = DatabaseQuery::new("q1", "SELECT 1", "{}", QueueType::Fast);

        let rejected = dispatcher.submit("missing", query).err().unwrap();
        assert!(matches!(rejected.reason, QueueError::UnknownDatabase(ref name) if name == "missing"));
        assert_eq!(rejected.into_query().query_id, "q1");

        let stats = dispatcher.manager().stats();
        assert_eq!(stats.total_queries_submitted, 0);
        assert_eq!(stats.queue_selection_counters, vec![0; 5]);
        dispatcher.manager().shutdown();
    }

    #[test]
    fn test_empty_query_is_rejected_without_counting() {
        let (dispatcher, connector) = dispatcher_with(&["orders"]);

        let rejected = dispatcher
            .submit_sql("orders", "q1", "", "{}", Some("fast"))
            .err()
            .unwrap();
        assert!(matches!(rejected.reason, QueueError::EmptyQuery(_)));
        assert_eq!(dispatcher.manager().stats().total_queries_submitted, 0);
        assert!(connector.executed_queries().is_empty());
        dispatcher.manager().shutdown();
    }

    #[test]
    fn test_submit_routes_by_hint() {
        let (dispatcher, _) = dispatcher_with(&["orders"]);
        let lead = dispatcher.manager().get_database("orders").unwrap();
        lead.spawn_child_queue(QueueType::Fast).unwrap();

        let (accepted, reply) = dispatcher
            .submit_sql("orders", "q1", "SELECT 1", "{}", Some("fast"))
            .unwrap();
        assert_eq!(accepted, QueueType::Fast);
        let outcome = tokio_test::block_on(reply).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.queue_type, QueueType::Fast);

        // Unknown and missing hints fall back to medium, served by the Lead
        let (accepted, reply) = dispatcher
            .submit_sql("orders", "q2", "SELECT 2", "{}", Some("FAST"))
            .unwrap();
        assert_eq!(accepted, QueueType::Lead);
        assert!(tokio_test::block_on(reply).unwrap().success);

        let stats = dispatcher.manager().stats();
        assert_eq!(stats.queue_selection_counters, vec![0, 1, 1, 0, 0]);
        assert_eq!(stats.total_queries_submitted, 2);
        dispatcher.manager().shutdown();
    }

    #[test]
    fn test_execute_awaits_outcome() {
        let (dispatcher, connector) = dispatcher_with(&["reports"]);
        connector.fail_execute_for("SELECT broken");

        let ok = tokio_test::block_on(dispatcher.execute("reports", "ok", "SELECT 1", "{}", None)).unwrap();
        assert!(ok.success);

        let failed = tokio_test::block_on(dispatcher.execute("reports", "bad", "SELECT broken", "{}", Some("slow")))
            .unwrap();
        assert!(!failed.success);
        assert!(failed.error_message.is_some());

        let missing = tokio_test::block_on(dispatcher.execute("nowhere", "x", "SELECT 1", "{}", None));
        assert!(matches!(missing, Err(DispatchError::Rejected(_))));
        dispatcher.manager().shutdown();
    }
}
