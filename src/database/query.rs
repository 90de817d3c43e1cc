//! Database Query Model
//!
//! The unit of work carried through the queues, and the outcome reported
//! back to its submitter.

use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::queue::{select_type, QueueType};

/// Current time as unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Statement name used for a template when the submitter gives none.
///
/// Identical templates map to the same name, so they share one prepared
/// statement per connection.
pub fn derive_statement_name(template: &str) -> String {
    let digest = Sha256::digest(template.as_bytes());
    format!("stmt_{}", hex::encode(&digest[..8]))
}

/// Final state of a query, delivered to the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub query_id: String,

    /// Queue that executed (or dropped) the query
    pub queue_type: QueueType,

    pub success: bool,
    pub timed_out: bool,
    pub row_count: u64,
    pub affected_rows: u64,
    pub data_json: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_us: u64,
}

impl QueryOutcome {
    pub(crate) fn failed(query_id: &str, queue_type: QueueType, message: impl Into<String>) -> Self {
        Self {
            query_id: query_id.to_string(),
            queue_type,
            success: false,
            timed_out: false,
            row_count: 0,
            affected_rows: 0,
            data_json: None,
            error_message: Some(message.into()),
            execution_time_us: 0,
        }
    }
}

/// A query waiting in, or being executed by, a queue
#[derive(Debug)]
pub struct DatabaseQuery {
    pub query_id: String,
    pub query_template: String,
    pub parameter_json: String,

    /// Queue class the submitter asked for
    pub queue_type_hint: QueueType,

    /// Explicit prepared statement name
    pub statement_name: Option<String>,

    pub submitted_at: u64,
    pub processed_at: Option<u64>,
    pub retry_count: u32,
    pub error_message: Option<String>,

    reply: Option<oneshot::Sender<QueryOutcome>>,
}

impl DatabaseQuery {
    pub fn new(
        query_id: impl Into<String>,
        query_template: impl Into<String>,
        parameter_json: impl Into<String>,
        queue_type_hint: QueueType,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            query_template: query_template.into(),
            parameter_json: parameter_json.into(),
            queue_type_hint,
            statement_name: None,
            submitted_at: unix_now(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
            reply: None,
        }
    }

    /// Build a query from a queue-type token (`"slow"`, `"fast"`, ...)
    pub fn with_hint_token(
        query_id: impl Into<String>,
        query_template: impl Into<String>,
        parameter_json: impl Into<String>,
        hint: Option<&str>,
    ) -> Self {
        Self::new(query_id, query_template, parameter_json, select_type(hint))
    }

    pub fn with_statement_name(mut self, name: impl Into<String>) -> Self {
        self.statement_name = Some(name.into());
        self
    }

    /// Attach a reply channel; the receiver resolves once the query is done
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<QueryOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }

    /// Name of the prepared statement this query runs through
    pub fn resolved_statement_name(&self) -> String {
        match &self.statement_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => derive_statement_name(&self.query_template),
        }
    }

    /// A query without SQL cannot be queued
    pub fn is_valid(&self) -> bool {
        !self.query_template.trim().is_empty()
    }

    /// Consume the query, reporting `outcome` to the submitter if it listens
    pub(crate) fn finish(mut self, outcome: QueryOutcome) {
        self.processed_at = Some(unix_now());
        self.error_message = outcome.error_message.clone();
        if let Some(reply) = self.reply.take() {
            // The submitter may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_name_derivation() {
        let a = derive_statement_name("SELECT * FROM users WHERE id = ?");
        let b = derive_statement_name("SELECT * FROM users WHERE id = ?");
        let c = derive_statement_name("SELECT 1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("stmt_"));
        assert_eq!(a.len(), "stmt_".len() + 16);
    }

    #[test]
    fn test_explicit_statement_name_wins() {
        let query = DatabaseQuery::new("q1", "SELECT 1", "{}", QueueType::Fast)
            .with_statement_name("get_one");
        assert_eq!(query.resolved_statement_name(), "get_one");

        let query = DatabaseQuery::new("q2", "SELECT 1", "{}", QueueType::Fast);
        assert_eq!(query.resolved_statement_name(), derive_statement_name("SELECT 1"));
    }

    #[test]
    fn test_hint_token_defaults_to_medium() {
        let query = DatabaseQuery::with_hint_token("q", "SELECT 1", "{}", Some("bogus"));
        assert_eq!(query.queue_type_hint, QueueType::Medium);

        let query = DatabaseQuery::with_hint_token("q", "SELECT 1", "{}", Some("cache"));
        assert_eq!(query.queue_type_hint, QueueType::Cache);
    }

    #[test]
    fn test_validity() {
        assert!(DatabaseQuery::new("q", "SELECT 1", "", QueueType::Slow).is_valid());
        assert!(!DatabaseQuery::new("q", "   ", "", QueueType::Slow).is_valid());
    }

    #[test]
    fn test_finish_delivers_outcome() {
        let (query, rx) = DatabaseQuery::new("q9", "SELECT 1", "{}", QueueType::Medium).with_reply();
        query.finish(QueryOutcome::failed("q9", QueueType::Medium, "no database connection"));

        let outcome = tokio_test::block_on(rx).unwrap();
        assert_eq!(outcome.query_id, "q9");
        assert!(!outcome.success);
        assert_eq!(outcome.error_message.as_deref(), Some("no database connection"));
    }

    #[test]
    fn test_finish_without_listener() {
        let (query, rx) = DatabaseQuery::new("q", "SELECT 1", "{}", QueueType::Medium).with_reply();
        drop(rx);
        query.finish(QueryOutcome::failed("q", QueueType::Medium, "dropped"));
    }
}
