//! Asset Insight - anomaly detection and forecasting service
//!
//! Replays an event feed through the anomaly and forecast coordinators,
//! persisting datapoints, classifications and predictions in sled.
//!
//! # Usage
//!
//! ```bash
//! # Replay a JSON-lines feed from stdin
//! cat feed.jsonl | asset-insight run
//!
//! # Replay from a file, registering already-known entities first
//! asset-insight run --input feed.jsonl --entities entities.json
//!
//! # Print diagnostic limit bands for one attribute
//! asset-insight limits --entity pump-1 --attribute pressure \
//!     --method global --deviation 10 --timespan-ms 3600000
//! ```
//!
//! # Feed format
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"entity","event":{"cause":"create","entity":{...}}}
//! {"type":"value","entity_id":"pump-1","attribute_name":"pressure","value":12.5,"timestamp":1700000000000}
//! ```
//!
//! # Environment Variables
//!
//! - `ASSET_INSIGHT_CONFIG`: Path to the TOML service config
//! - `ASSET_INSIGHT_DB`: Override the sled database path
//! - `RUST_LOG`: Logging level (default: info)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use asset_insight::anomaly::compute_limit_bands;
use asset_insight::config::{self, InsightConfig};
use asset_insight::{
    AnomalyDetectionCoordinator, AnomalySettings, AttributeEvent, AttributeRef, DetectionConfig,
    DetectionKind, Entity, EntityEvent, ForecastCoordinator, ForecastScheduler, SchedulerSettings,
    SledStore, SystemClock, ValueDatapoint,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "asset-insight")]
#[command(about = "Anomaly detection and forecasting for asset attributes")]
#[command(version)]
struct CliArgs {
    /// Sled database directory (default: storage.path from the config)
    #[arg(long, env = "ASSET_INSIGHT_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Replay a JSON-lines event feed
    Run {
        /// Feed file (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// JSON array of entities to register before the feed starts
        #[arg(long)]
        entities: Option<PathBuf>,
    },

    /// Print diagnostic limit bands as JSON
    Limits {
        #[arg(long)]
        entity: String,

        #[arg(long)]
        attribute: String,

        /// Detection method (global or change)
        #[arg(long, default_value = "global")]
        method: String,

        /// Allowed deviation in percent
        #[arg(long)]
        deviation: f64,

        /// Look-back timespan in milliseconds
        #[arg(long)]
        timespan_ms: i64,

        /// Minimum datapoints before bands are computed
        #[arg(long, default_value = "2")]
        min_datapoints: u32,
    },
}

// ============================================================================
// Feed Messages
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    Entity { event: EntityEvent },
    Value(AttributeEvent),
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    config::init(InsightConfig::load());
    let service_config = config::get().cloned().unwrap_or_default();
    let db_path = args
        .db
        .unwrap_or_else(|| PathBuf::from(&service_config.storage.path));

    match args.command {
        SubCommand::Run { input, entities } => {
            run(&service_config, db_path, input, entities).await
        }
        SubCommand::Limits {
            entity,
            attribute,
            method,
            deviation,
            timespan_ms,
            min_datapoints,
        } => {
            let kind = match method.as_str() {
                "global" => DetectionKind::Global,
                "change" => DetectionKind::Change,
                "timespan" => DetectionKind::Timespan,
                other => anyhow::bail!("Unknown detection method '{}'", other),
            };
            let detection = DetectionConfig::new(kind, deviation, timespan_ms, min_datapoints);
            let store = SledStore::open(&db_path)
                .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
            let bands = compute_limit_bands(
                &store,
                &AttributeRef::new(entity, attribute),
                &detection,
                AnomalySettings::from_config().limits_history_multiplier,
            )?;
            println!("{}", serde_json::to_string_pretty(&bands)?);
            Ok(())
        }
    }
}

// ============================================================================
// Replay
// ============================================================================

async fn run(
    service_config: &InsightConfig,
    db_path: PathBuf,
    input: Option<PathBuf>,
    entities: Option<PathBuf>,
) -> Result<()> {
    let store = Arc::new(
        SledStore::open(&db_path)
            .with_context(|| format!("Failed to open store at {}", db_path.display()))?,
    );

    let anomaly = service_config
        .anomaly
        .enabled
        .then(|| AnomalyDetectionCoordinator::new(store.clone(), store.clone()));
    let forecast = if service_config.forecast.enabled {
        let scheduler = ForecastScheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(SystemClock),
            SchedulerSettings::from_config(),
        )?;
        Some(ForecastCoordinator::new(scheduler))
    } else {
        None
    };

    let mut known: HashMap<String, Entity> = HashMap::new();
    if let Some(path) = entities {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let initial: Vec<Entity> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse entities from {}", path.display()))?;
        if let Some(anomaly) = &anomaly {
            anomaly.bootstrap(&initial);
        }
        if let Some(forecast) = &forecast {
            forecast.bootstrap(&initial)?;
        }
        known.extend(initial.into_iter().map(|e| (e.id.clone(), e)));
    }

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();
    let mut processed = 0u64;

    loop {
        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read feed")?,
        };
        let Some(line) = line else {
            info!("End of feed after {} messages", processed);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<FeedMessage>(line) {
            Ok(FeedMessage::Entity { event }) => {
                if let Some(anomaly) = &anomaly {
                    anomaly.handle_entity_event(&event);
                }
                if let Some(forecast) = &forecast {
                    if let Err(e) = forecast.handle_entity_event(&event) {
                        warn!("Forecast update for {} failed: {}", event.entity().id, e);
                    }
                }
                match event {
                    EntityEvent::Delete { entity } => {
                        known.remove(&entity.id);
                    }
                    EntityEvent::Create { entity } | EntityEvent::Update { entity, .. } => {
                        known.insert(entity.id.clone(), entity);
                    }
                }
            }
            Ok(FeedMessage::Value(event)) => {
                record_datapoint(&store, &known, &event)?;
                if let Some(anomaly) = &anomaly {
                    match anomaly.on_attribute_event(&event) {
                        Ok(Some(classification)) => println!(
                            "{}",
                            serde_json::json!({
                                "entity_id": event.entity_id,
                                "attribute_name": event.attribute_name,
                                "timestamp": event.timestamp,
                                "classification": classification.to_string(),
                            })
                        ),
                        Ok(None) => {}
                        Err(e) => warn!("Anomaly detection for {} failed: {}", event.attribute_ref(), e),
                    }
                }
            }
            Err(e) => {
                warn!("Skipping malformed feed line: {}", e);
                continue;
            }
        }
        processed += 1;
    }

    if let Some(forecast) = &forecast {
        if !forecast.shutdown(service_config.forecast.stop_timeout()).await {
            warn!("Forecast scheduler interrupted during shutdown");
        }
    }
    store.flush().context("Failed to flush store")?;
    info!(
        "Shutdown complete ({} messages, store {} bytes)",
        processed,
        store.size_bytes()
    );
    Ok(())
}

/// Persist the raw datapoint for attributes that store their history.
fn record_datapoint(
    store: &SledStore,
    known: &HashMap<String, Entity>,
    event: &AttributeEvent,
) -> Result<()> {
    let stores_datapoints = known
        .get(&event.entity_id)
        .and_then(|e| e.attribute(&event.attribute_name))
        .is_some_and(|a| a.meta.store_datapoints);
    let Some(value) = event.numeric_value().filter(|_| stores_datapoints) else {
        return Ok(());
    };
    store
        .append_datapoint(&event.attribute_ref(), ValueDatapoint::new(event.timestamp, value))
        .with_context(|| format!("Failed to store datapoint for {}", event.attribute_ref()))?;
    debug!("Stored datapoint {} @ {}", event.attribute_ref(), event.timestamp);
    Ok(())
}
