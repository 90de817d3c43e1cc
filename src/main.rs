//! dbqueue
//!
//! Starts one Lead queue per configured database, then executes JSON
//! query lines read from stdin:
//!
//! `{"database": "orders", "queue": "fast", "sql": "SELECT 1", "params": "{}"}`
//!
//! Outcomes are printed as JSON lines; at end of input the aggregate
//! stats are printed and every queue is shut down.

use std::env;
use std::sync::Arc;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use dbqueue::engine::MemoryConnector;
use dbqueue::{DatabaseQueueManager, EngineKind, EngineRegistry, QueryDispatcher, QueueConfig};

#[derive(Debug, Deserialize)]
struct QueryLine {
    database: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    queue: Option<String>,
    sql: String,
    #[serde(default = "empty_params")]
    params: String,
}

fn empty_params() -> String {
    "{}".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let dry_run = env::args().any(|arg| arg == "--dry-run");
    let config = QueueConfig::load().context("Failed to load queue configuration")?;

    let registry = EngineRegistry::new(config.engine_library_paths.clone());
    if dry_run {
        log::info!("Dry run: serving every engine from memory");
        for kind in EngineKind::ALL {
            registry.register(Arc::new(MemoryConnector::new(kind)));
        }
    }

    let config = Arc::new(config);
    let manager = Arc::new(DatabaseQueueManager::new(
        config.max_databases,
        Arc::new(registry),
        Arc::clone(&config),
    ));

    for definition in &config.databases {
        let lead = manager
            .create_database(definition)
            .with_context(|| format!("Failed to start database {}", definition.name))?;
        log::info!("{}: started", lead.label());
    }

    let dispatcher = QueryDispatcher::new(Arc::clone(&manager));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();
    let mut line_number = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: QueryLine = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Line {}: invalid query: {}", line_number, e);
                continue;
            }
        };
        let query_id = request.id.unwrap_or_else(|| format!("line-{}", line_number));

        match dispatcher.submit_sql(
            &request.database,
            &query_id,
            &request.sql,
            &request.params,
            request.queue.as_deref(),
        ) {
            Ok((queue_type, reply)) => {
                log::debug!("Query {} accepted by {} queue", query_id, queue_type);
                pending.push(tokio::spawn(async move {
                    match reply.await {
                        Ok(outcome) => match serde_json::to_string(&outcome) {
                            Ok(json) => println!("{}", json),
                            Err(e) => log::error!("Query {}: cannot encode outcome: {}", query_id, e),
                        },
                        Err(_) => log::error!("Query {} was dropped without a result", query_id),
                    }
                }));
            }
            Err(rejected) => log::warn!("Line {}: {}", line_number, rejected),
        }
    }

    for task in pending {
        if let Err(e) = task.await {
            log::error!("Reply task failed: {}", e);
        }
    }

    let report = serde_json::json!({
        "stats": manager.stats_json(),
        "databases": manager.databases_json(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("Shutdown task failed")?;
    Ok(())
}
