//! Prepared Statement Cache
//!
//! Per-connection bounded table of prepared statements with
//! least-recently-used eviction. Every touch stamps the statement with a
//! value from a single monotonic counter owned by the cache, and the
//! statement with the smallest stamp is the one evicted.

use std::num::NonZeroUsize;
use lru::LruCache;

use crate::engine::connstring::DEFAULT_STATEMENT_CACHE_SIZE;
use crate::engine::{ConnectionHandle, EngineConnector, StatementHandle};
use super::query::unix_now;
use super::CacheError;

/// A statement prepared on one connection
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub name: String,
    pub sql_template: String,

    /// Unix seconds when first prepared
    pub created_at: u64,

    /// Cache hits since it was prepared
    pub usage_count: u64,

    /// Recency stamp from the owning cache's counter
    pub lru_counter: u64,

    /// Engine handle, released through the connector
    pub handle: StatementHandle,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl StatementCacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Bounded LRU table of prepared statements for one connection.
///
/// The cache is owned by the connection it caches for and is only ever
/// touched by that connection's queue thread, so it needs no lock.
pub struct StatementCache {
    /// name -> statement, ordered by recency
    statements: LruCache<String, PreparedStatement>,
    capacity: usize,
    counter: u64,
    stats: StatementCacheStats,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements (0 selects the default)
    pub fn new(capacity: usize) -> Self {
        let bound = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_STATEMENT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            statements: LruCache::new(bound),
            capacity: bound.get(),
            counter: 0,
            stats: StatementCacheStats::default(),
        }
    }

    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Return the handle for `name`, preparing it on a miss.
    ///
    /// A hit issues no engine call. A miss prepares through `connector`
    /// first and only then evicts the least recently touched statement if
    /// the cache is full, so a failed prepare leaves the cache untouched.
    pub fn prepare(
        &mut self,
        connector: &dyn EngineConnector,
        connection: ConnectionHandle,
        name: &str,
        sql: &str,
    ) -> Result<StatementHandle, CacheError> {
        if name.is_empty() {
            return Err(CacheError::InvalidStatement("statement name is empty".to_string()));
        }
        if sql.is_empty() {
            return Err(CacheError::InvalidStatement(format!("statement {} has no SQL", name)));
        }
        if connection.engine() != connector.kind() {
            return Err(CacheError::EngineMismatch {
                connector: connector.kind(),
                connection: connection.engine(),
            });
        }

        if self.statements.contains(name) {
            let counter = self.next_counter();
            self.stats.hits += 1;
            if let Some(statement) = self.statements.get_mut(name) {
                statement.lru_counter = counter;
                statement.usage_count += 1;
                return Ok(statement.handle);
            }
        }

        self.stats.misses += 1;
        let handle = connector.prepare(connection, name, sql)?;

        if self.statements.len() >= self.capacity {
            if let Some((evicted_name, evicted)) = self.statements.pop_lru() {
                connector.unprepare(connection, evicted.handle);
                self.stats.evictions += 1;
                log::debug!(
                    "Evicted prepared statement {} (lru {}) for {}",
                    evicted_name,
                    evicted.lru_counter,
                    name
                );
            }
        }

        let lru_counter = self.next_counter();
        self.statements.put(
            name.to_string(),
            PreparedStatement {
                name: name.to_string(),
                sql_template: sql.to_string(),
                created_at: unix_now(),
                usage_count: 0,
                lru_counter,
                handle,
            },
        );

        Ok(handle)
    }

    /// Release one statement by name
    pub fn unprepare(
        &mut self,
        connector: &dyn EngineConnector,
        connection: ConnectionHandle,
        name: &str,
    ) -> bool {
        match self.statements.pop(name) {
            Some(statement) => {
                connector.unprepare(connection, statement.handle);
                true
            }
            None => false,
        }
    }

    /// Release every statement; called before the connection goes away
    pub fn clear(&mut self, connector: &dyn EngineConnector, connection: ConnectionHandle) {
        while let Some((_, statement)) = self.statements.pop_lru() {
            connector.unprepare(connection, statement.handle);
        }
    }

    /// Look up a statement without touching its recency
    pub fn get(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.peek(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains(name)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last value handed out by the recency counter
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Statement names, least recently used first
    pub fn names(&self) -> Vec<String> {
        self.statements.iter().rev().map(|(name, _)| name.clone()).collect()
    }

    pub fn stats(&self) -> &StatementCacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConnectionConfig, EngineKind, MemoryConnector};

    fn connect(connector: &MemoryConnector) -> ConnectionHandle {
        let config = ConnectionConfig::parse("sqlite:///tmp/cache_test.db").unwrap();
        connector.connect(&config).unwrap()
    }

    #[test]
    fn test_cache_size_two_evicts_oldest() {
        let connector = MemoryConnector::new(EngineKind::Sqlite).with_statement_handles(0x1111);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(2);

        cache.prepare(&connector, conn, "stmt_1", "SELECT 1").unwrap();
        cache.prepare(&connector, conn, "stmt_2", "SELECT 2").unwrap();
        assert_eq!(cache.len(), 2);

        cache.prepare(&connector, conn, "stmt_3", "SELECT 3").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.names(), vec!["stmt_2".to_string(), "stmt_3".to_string()]);
        assert!(!cache.contains("stmt_1"));

        // The evicted statement's engine handle was released
        assert_eq!(connector.calls().unprepare, 1);
        assert_eq!(
            connector.live_statement_names(conn),
            vec!["stmt_2".to_string(), "stmt_3".to_string()]
        );
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_size_one_replaces_every_time() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(1);

        cache.prepare(&connector, conn, "stmt_1", "SELECT 1").unwrap();
        cache.prepare(&connector, conn, "stmt_2", "SELECT 2").unwrap();
        assert_eq!(cache.names(), vec!["stmt_2".to_string()]);

        cache.prepare(&connector, conn, "stmt_3", "SELECT 3").unwrap();
        assert_eq!(cache.names(), vec!["stmt_3".to_string()]);
        assert_eq!(connector.live_statements(), 1);
    }

    #[test]
    fn test_hit_makes_no_engine_call_and_refreshes_recency() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(2);

        let first = cache.prepare(&connector, conn, "a", "SELECT 'a'").unwrap();
        cache.prepare(&connector, conn, "b", "SELECT 'b'").unwrap();

        let again = cache.prepare(&connector, conn, "a", "SELECT 'a'").unwrap();
        assert_eq!(first, again);
        assert_eq!(connector.calls().prepare, 2);
        assert_eq!(cache.get("a").unwrap().usage_count, 1);

        // "b" is now the least recently touched and goes first
        cache.prepare(&connector, conn, "c", "SELECT 'c'").unwrap();
        assert_eq!(cache.names(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 3);
    }

    #[test]
    fn test_counter_strictly_increases() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(3);

        let mut last = 0;
        for name in ["x", "y", "x", "z", "y", "w", "x"] {
            cache.prepare(&connector, conn, name, "SELECT 1").unwrap();
            let stamp = cache.get(name).unwrap().lru_counter;
            assert!(stamp > last);
            last = stamp;
            assert!(cache.len() <= cache.capacity());
        }
        assert_eq!(cache.counter(), 7);
    }

    #[test]
    fn test_failed_prepare_leaves_cache_unchanged() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(1);

        cache.prepare(&connector, conn, "keep", "SELECT 1").unwrap();
        connector.fail_prepare_for("broken");

        let result = cache.prepare(&connector, conn, "broken", "SELECT 2");
        assert!(matches!(result, Err(CacheError::Engine(_))));
        assert_eq!(cache.names(), vec!["keep".to_string()]);
        assert_eq!(connector.calls().unprepare, 0);
    }

    #[test]
    fn test_validation_issues_no_engine_call() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(4);

        assert!(cache.prepare(&connector, conn, "", "SELECT 1").is_err());
        assert!(cache.prepare(&connector, conn, "empty", "").is_err());

        let mysql = MemoryConnector::new(EngineKind::MySql);
        assert!(matches!(
            cache.prepare(&mysql, conn, "wrong", "SELECT 1"),
            Err(CacheError::EngineMismatch { .. })
        ));

        assert_eq!(connector.calls().prepare, 0);
        assert_eq!(mysql.calls().prepare, 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let cache = StatementCache::new(0);
        assert_eq!(cache.capacity(), DEFAULT_STATEMENT_CACHE_SIZE);
        assert_eq!(StatementCache::new(1).capacity(), 1);
        assert_eq!(StatementCache::new(7).capacity(), 7);
    }

    #[test]
    fn test_unprepare_and_clear_release_handles() {
        let connector = MemoryConnector::new(EngineKind::Sqlite);
        let conn = connect(&connector);
        let mut cache = StatementCache::new(8);

        for name in ["s1", "s2", "s3"] {
            cache.prepare(&connector, conn, name, "SELECT 1").unwrap();
        }
        assert!(cache.unprepare(&connector, conn, "s2"));
        assert!(!cache.unprepare(&connector, conn, "s2"));
        assert_eq!(connector.live_statements(), 2);

        cache.clear(&connector, conn);
        assert!(cache.is_empty());
        assert_eq!(connector.live_statements(), 0);
    }
}
