//! Pipeline worker entry point.
//!
//! One process runs one role of one pipeline, selected by `ROLE`; the spec
//! comes from the JSON file at `PIPELINE_CONFIG_PATH`. Exit codes: 0 clean
//! shutdown, 1 startup error, 2 runtime failure.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use streamforge::bus::BusConfig;
use streamforge::error::ErrorKind;
use streamforge::runtime::{run_worker, Role, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "streamforge-worker", about = "StreamForge pipeline worker")]
struct Args {
    /// Role this process runs.
    #[arg(long, env = "ROLE", value_enum)]
    role: Role,

    /// Path to the pipeline spec JSON.
    #[arg(long, env = "PIPELINE_CONFIG_PATH")]
    pipeline_config_path: PathBuf,

    /// Source topic, required for per-topic roles.
    #[arg(long, env = "TOPIC")]
    topic: Option<String>,

    /// Subject shard this replica is pinned to.
    #[arg(long, env = "SHARD")]
    shard: Option<u32>,

    /// Stream bus URL.
    #[arg(long, env = "BUS_URL", default_value = "nats://localhost:4222")]
    bus_url: String,

    /// Kafka bootstrap servers, comma separated.
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    kafka_brokers: String,

    /// Shared dedup backend; omitted means the embedded store.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Drain deadline on SIGINT/SIGTERM, in seconds.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.role.is_per_topic() && args.topic.is_none() {
        error!(role = %args.role, "per-topic role started without TOPIC");
        std::process::exit(1);
    }

    let config = WorkerConfig {
        role: args.role,
        pipeline_config_path: args.pipeline_config_path,
        topic: args.topic,
        shard: args.shard,
        bus: BusConfig {
            url: args.bus_url,
            ..Default::default()
        },
        kafka_brokers: args
            .kafka_brokers
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        redis_url: args.redis_url,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        ..Default::default()
    };

    match run_worker(config).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::ConfigInvalid => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "worker failed");
            std::process::exit(2);
        }
    }
}
