//! Queue Configuration
//!
//! Settings for the queue manager, its Lead queues and their Worker
//! children. Loaded from a JSON file and/or `DBQUEUE_*` environment
//! variables; every field has a default.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::connstring::DEFAULT_STATEMENT_CACHE_SIZE;
use crate::queue::QueueType;

/// Maximum children a Lead may own
pub const MAX_CHILD_QUEUES: usize = 4;

/// When a Lead spawns and retires Worker children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildPolicy {
    /// Worker types started with the Lead and kept alive
    pub start: Vec<QueueType>,

    /// Lead backlog for one type that triggers an on-demand Worker (0 disables)
    pub scale_up_depth: usize,

    /// Idle time after which an on-demand Worker is retired (0 disables)
    pub idle_retire_seconds: u64,
}

impl Default for ChildPolicy {
    fn default() -> Self {
        Self {
            start: Vec::new(),
            scale_up_depth: 8,
            idle_retire_seconds: 300,
        }
    }
}

/// One logical database served by a Lead queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDefinition {
    pub name: String,
    pub connection_string: String,

    /// Run once on the Lead's first connection; `""` is a no-op
    #[serde(default)]
    pub bootstrap_query: Option<String>,

    /// Overrides `QueueConfig::child_policy` for this database
    #[serde(default)]
    pub child_policy: Option<ChildPolicy>,
}

/// Queue manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum registered databases (default: 10)
    pub max_databases: usize,

    /// Maximum Worker children per Lead (default: 4)
    pub max_child_queues: usize,

    /// Prepared statements kept per connection (default: 1000)
    pub prepared_statement_cache_size: usize,

    /// Seconds between heartbeats (default: 30)
    pub heartbeat_interval_seconds: u64,

    /// Longest idle wait of a queue thread before it re-checks its state (default: 1000ms)
    pub worker_wait_millis: u64,

    /// Per-query execution timeout (default: 30s)
    pub query_timeout_seconds: u32,

    /// Connect timeout (default: 10s)
    pub connect_timeout_seconds: u32,

    /// Initial capacity of the per-database statement name cache
    pub name_cache_initial_capacity: usize,

    /// Directories searched for engine libraries
    pub engine_library_paths: Vec<PathBuf>,

    /// Default child policy for every database
    pub child_policy: ChildPolicy,

    /// Databases to serve
    pub databases: Vec<DatabaseDefinition>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_databases: 10,
            max_child_queues: MAX_CHILD_QUEUES,
            prepared_statement_cache_size: DEFAULT_STATEMENT_CACHE_SIZE,
            heartbeat_interval_seconds: 30,
            worker_wait_millis: 1000,
            query_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            name_cache_initial_capacity: 16,
            engine_library_paths: Vec::new(),
            child_policy: ChildPolicy::default(),
            databases: Vec::new(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: QueueConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `DBQUEUE_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match env::var("DBQUEUE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `DBQUEUE_*` environment variables
    pub fn apply_env(&mut self) {
        self.max_databases = env_or("DBQUEUE_MAX_DATABASES", self.max_databases);
        self.max_child_queues = env_or("DBQUEUE_MAX_CHILD_QUEUES", self.max_child_queues);
        self.prepared_statement_cache_size =
            env_or("DBQUEUE_STATEMENT_CACHE_SIZE", self.prepared_statement_cache_size);
        self.heartbeat_interval_seconds =
            env_or("DBQUEUE_HEARTBEAT_SECONDS", self.heartbeat_interval_seconds);
        self.worker_wait_millis = env_or("DBQUEUE_WORKER_WAIT_MS", self.worker_wait_millis);
        self.query_timeout_seconds = env_or("DBQUEUE_QUERY_TIMEOUT", self.query_timeout_seconds);

        if let Ok(paths) = env::var("DBQUEUE_ENGINE_PATH") {
            self.engine_library_paths = env::split_paths(&paths).collect();
        }
    }

    /// Check limits
    pub fn validate(&self) -> Result<()> {
        if self.max_databases == 0 {
            return Err(anyhow!("max_databases must be at least 1"));
        }
        if self.max_child_queues > MAX_CHILD_QUEUES {
            return Err(anyhow!(
                "max_child_queues is {} but a Lead can own at most {}",
                self.max_child_queues,
                MAX_CHILD_QUEUES
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow!("heartbeat_interval_seconds must be at least 1"));
        }
        for database in &self.databases {
            if database.name.is_empty() {
                return Err(anyhow!("database definitions need a name"));
            }
            if database.connection_string.is_empty() {
                return Err(anyhow!("database {} has no connection string", database.name));
            }
            let policy = database.child_policy.as_ref().unwrap_or(&self.child_policy);
            if policy.start.contains(&QueueType::Lead) {
                return Err(anyhow!("database {}: a Lead cannot start a Lead child", database.name));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn worker_wait(&self) -> Duration {
        Duration::from_millis(self.worker_wait_millis.max(1))
    }

    /// Child policy in effect for a database
    pub fn policy_for(&self, database: &DatabaseDefinition) -> ChildPolicy {
        database
            .child_policy
            .clone()
            .unwrap_or_else(|| self.child_policy.clone())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid value for {}: {}", key, value);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_databases, 10);
        assert_eq!(config.max_child_queues, 4);
        assert_eq!(config.prepared_statement_cache_size, 1000);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.worker_wait(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbqueue.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "max_databases": 3,
                "heartbeat_interval_seconds": 5,
                "child_policy": {{ "start": ["fast", "cache"] }},
                "databases": [
                    {{ "name": "app", "connection_string": "sqlite:///tmp/app.db", "bootstrap_query": "" }},
                    {{
                        "name": "reports",
                        "connection_string": "postgresql://u:p@localhost/reports",
                        "child_policy": {{ "start": ["slow"], "scale_up_depth": 0 }}
                    }}
                ]
            }}"#
        )
        .unwrap();

        let config = QueueConfig::from_file(&path).unwrap();
        assert_eq!(config.max_databases, 3);
        assert_eq!(config.max_child_queues, 4);
        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[0].bootstrap_query.as_deref(), Some(""));
        assert_eq!(config.databases[1].bootstrap_query, None);

        let app = config.policy_for(&config.databases[0]);
        assert_eq!(app.start, vec![QueueType::Fast, QueueType::Cache]);
        assert_eq!(app.scale_up_depth, 8);

        let reports = config.policy_for(&config.databases[1]);
        assert_eq!(reports.start, vec![QueueType::Slow]);
        assert_eq!(reports.scale_up_depth, 0);
        assert_eq!(reports.idle_retire_seconds, 300);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(QueueConfig::from_file(dir.path().join("missing.json")).is_err());

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(QueueConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_validate_limits() {
        let config = QueueConfig {
            max_child_queues: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = QueueConfig {
            max_databases: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = QueueConfig {
            databases: vec![DatabaseDefinition {
                name: "x".to_string(),
                connection_string: "x.db".to_string(),
                bootstrap_query: None,
                child_policy: Some(ChildPolicy {
                    start: vec![QueueType::Lead],
                    ..Default::default()
                }),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
