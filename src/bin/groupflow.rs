//! groupflow runtime - aggregates JSON-lines work items from stdin
//!
//! Each input line is one work item:
//!
//! ```json
//! {"body": "A", "headers": {"correlation_id": "order-1"}, "batch_size": 3}
//! ```
//!
//! Items are correlated on a header, bodies are concatenated, and every
//! completed group is written to stdout as one JSON line.
//!
//! ## Usage
//!
//! ```bash
//! GROUPFLOW_COMPLETION_SIZE=3 cargo run --release --bin groupflow < items.jsonl
//! ```
//!
//! ## Environment Variables
//!
//! - GROUPFLOW_CORRELATION_HEADER - Header holding the correlation key (default: correlation_id)
//! - GROUPFLOW_SEPARATOR - Separator placed between merged bodies (default: +)
//! - GROUPFLOW_COMPLETION_MARKER - Complete a group once its body contains this text (optional)
//! - GROUPFLOW_DB_PATH - SQLite store path; in-memory store when unset
//! - All other `GROUPFLOW_*` knobs, see `AggregatorConfig` and `StoreConfig`
//! - RUST_LOG - Logging level (optional, default: info)

use async_trait::async_trait;
use groupflow::aggregation::{
    AggregationCore, AggregationError, AggregatorConfig, BodyContains, Concatenation,
    CorrelationKey, DeliveryError, Downstream, HeaderExpression, MemoryAggregationStore,
    SqliteAggregationStore, StoreConfig, WorkItem,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of input
#[derive(Debug, Deserialize)]
struct InputRecord {
    body: Value,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    batch_size: Option<usize>,
}

impl From<InputRecord> for WorkItem {
    fn from(record: InputRecord) -> Self {
        let mut item = WorkItem::new(record.body);
        item.headers = record.headers;
        item.properties.batch_size = record.batch_size;
        item
    }
}

/// Writes completed groups to stdout, one JSON document per line
struct StdoutDownstream {
    out: Mutex<std::io::Stdout>,
}

#[async_trait]
impl Downstream for StdoutDownstream {
    async fn deliver(&self, group: &WorkItem) -> Result<(), DeliveryError> {
        let line =
            serde_json::to_string(group).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| DeliveryError::Rejected("stdout lock poisoned".to_string()))?;
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| DeliveryError::Rejected(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let config = AggregatorConfig::from_env();
    let store_config = StoreConfig::from_env();
    let header = env::var("GROUPFLOW_CORRELATION_HEADER")
        .unwrap_or_else(|_| "correlation_id".to_string());
    let separator = env::var("GROUPFLOW_SEPARATOR").unwrap_or_else(|_| "+".to_string());
    let marker = env::var("GROUPFLOW_COMPLETION_MARKER")
        .ok()
        .filter(|m| !m.is_empty());

    log::info!("🚀 Starting groupflow");
    log::info!("   Correlation header: {}", header);
    log::info!("   Completion size: {}", config.completion_size);
    log::info!("   Completion timeout: {}ms", config.completion_timeout_ms);
    log::info!("   Completion interval: {}ms", config.completion_interval_ms);
    log::info!(
        "   Completion marker: {}",
        marker.as_deref().unwrap_or("(none)")
    );

    let mut builder = AggregationCore::builder()
        .config(config)
        .correlation(HeaderExpression::<CorrelationKey>::new(header))
        .strategy(Concatenation::new(separator))
        .downstream(Arc::new(StdoutDownstream {
            out: Mutex::new(std::io::stdout()),
        }));

    if let Some(marker) = marker {
        builder = builder.completion_predicate(BodyContains::new(marker));
    }

    builder = match &store_config.db_path {
        Some(path) => {
            log::info!("   Store: sqlite ({})", path);
            builder.recoverable_store(Arc::new(SqliteAggregationStore::open(
                path,
                store_config.recovery_settings(),
            )?))
        }
        None => {
            log::info!("   Store: memory");
            builder.recoverable_store(Arc::new(MemoryAggregationStore::with_recovery(
                store_config.recovery_settings(),
            )))
        }
    };

    let core = builder.build()?;
    core.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }

                let record: InputRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("Skipping malformed input line: {}", e);
                        rejected += 1;
                        continue;
                    }
                };

                match core.process(record.into()).await {
                    Ok(_) => accepted += 1,
                    Err(AggregationError::Store(e)) => {
                        log::error!("Store failure, stopping: {}", e);
                        core.shutdown().await?;
                        return Err(e.into());
                    }
                    Err(e) => {
                        log::warn!("{}", e);
                        rejected += 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    log::info!("Input finished ({} accepted, {} rejected)", accepted, rejected);
    core.shutdown().await?;
    Ok(())
}
