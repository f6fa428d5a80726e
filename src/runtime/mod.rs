//! Per-role worker runtime.
//!
//! Each worker process runs exactly one role of one pipeline. The process
//! layout is fixed: reader task(s) pulling from the bus (two for the
//! joiner), a writer task publishing downstream, and a supervisor task that
//! folds catalog status changes into pause/resume and external signals into
//! an orderly drain.

pub mod dedup;
pub mod ingest;
pub mod join;
pub mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{BusClient, BusConfig};
use crate::catalog::PipelineCatalog;
use crate::dedup::{DedupStore, MemoryDedupStore, RedisDedupStore};
use crate::error::{PipelineError, Result};
use crate::models::{topology, PipelineSpec, PipelineStatus};

/// The unit of process deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Kafka topic -> input stream bridge.
    Ingestor,

    /// Filter/dedup/transform chain between input and dedup streams.
    Dedup,

    /// Temporal joiner between two dedup streams and the join stream.
    Join,

    /// Bus -> columnar store batcher.
    Sink,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Ingestor => "ingestor",
            Role::Dedup => "dedup",
            Role::Join => "join",
            Role::Sink => "sink",
        }
    }

    /// Per-topic roles additionally need `TOPIC` in their environment.
    pub fn is_per_topic(&self) -> bool {
        matches!(self, Role::Ingestor | Role::Dedup)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the role loops are pulling or holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
}

/// Everything a worker process needs, assembled from its environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub role: Role,

    /// Path to the JSON pipeline spec.
    pub pipeline_config_path: PathBuf,

    /// Source topic, for per-topic roles.
    pub topic: Option<String>,

    /// Subject shard this replica is pinned to; `None` reads the wildcard.
    pub shard: Option<u32>,

    pub bus: BusConfig,

    /// Kafka bootstrap servers (ingestor only).
    pub kafka_brokers: Vec<String>,

    /// Shared dedup backend; absent means the embedded store.
    pub redis_url: Option<String>,

    pub shutdown_timeout: Duration,

    /// Retention of the pipeline's bus streams.
    pub stream_max_age: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            role: Role::Sink,
            pipeline_config_path: PathBuf::from("pipeline.json"),
            topic: None,
            shard: None,
            bus: BusConfig::default(),
            kafka_brokers: vec!["localhost:9092".to_string()],
            redis_url: None,
            shutdown_timeout: Duration::from_secs(30),
            stream_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Load and validate the pipeline spec a worker was pointed at.
pub fn load_spec(path: &Path) -> Result<PipelineSpec> {
    let raw = std::fs::read(path).map_err(|e| {
        PipelineError::ConfigInvalid(format!("read spec {}: {e}", path.display()))
    })?;
    let spec: PipelineSpec = serde_json::from_slice(&raw).map_err(|e| {
        PipelineError::ConfigInvalid(format!("parse spec {}: {e}", path.display()))
    })?;
    spec.validate()?;
    Ok(spec)
}

/// Cancellation token wired to SIGINT/SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let interrupted = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        };

        interrupted.await;
        info!("shutdown signal received, draining");
        trigger.cancel();
    });

    token
}

/// Supervisor task: mirrors the catalog status into the run-state channel
/// and cancels the worker when the pipeline is stopping or terminating.
///
/// Readers tolerate catalog staleness up to one reconcile tick.
pub async fn supervise(
    catalog: PipelineCatalog,
    pipeline_id: String,
    control: watch::Sender<RunState>,
    cancel: CancellationToken,
) {
    let tick = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }

        let status = match catalog.get(&pipeline_id).await {
            Ok(spec) => spec.status.overall,
            Err(PipelineError::PipelineNotFound(_)) => {
                info!(pipeline = %pipeline_id, "pipeline gone from catalog, stopping");
                cancel.cancel();
                return;
            }
            Err(e) => {
                warn!(pipeline = %pipeline_id, error = %e, "catalog read failed");
                continue;
            }
        };

        match status {
            PipelineStatus::Pausing | PipelineStatus::Paused => {
                let _ = control.send(RunState::Paused);
            }
            PipelineStatus::Resuming | PipelineStatus::Running | PipelineStatus::Created => {
                let _ = control.send(RunState::Running);
            }
            PipelineStatus::Stopping
            | PipelineStatus::Stopped
            | PipelineStatus::Terminating
            | PipelineStatus::Terminated
            | PipelineStatus::Failed => {
                info!(pipeline = %pipeline_id, status = %status, "stopping per catalog status");
                cancel.cancel();
                return;
            }
        }
    }
}

/// Build the dedup store a worker should use.
async fn dedup_store(config: &WorkerConfig, pipeline_id: &str) -> Result<Arc<dyn DedupStore>> {
    match &config.redis_url {
        Some(url) => {
            let prefix = format!("{pipeline_id}.dedup");
            Ok(Arc::new(RedisDedupStore::connect(url, prefix).await?))
        }
        None => Ok(Arc::new(MemoryDedupStore::new())),
    }
}

/// Run one worker process to completion.
///
/// The returned error (if any) decides the process exit code: config errors
/// never enter the running state, runtime errors exit 2, a drained worker
/// exits 0.
pub async fn run_worker(config: WorkerConfig) -> Result<()> {
    let spec = load_spec(&config.pipeline_config_path)?;
    let pipeline_id = spec.id.clone();
    let worker_id = uuid::Uuid::new_v4();

    info!(pipeline = %pipeline_id, role = %config.role, worker = %worker_id, "worker starting");

    let bus = BusClient::connect(config.bus.clone()).await?;

    // Stream provisioning is idempotent; every worker ensures the topology
    // it touches so start order does not matter.
    for stream in topology::all_streams(&spec) {
        bus.ensure_stream(&stream, vec![topology::wildcard(&stream)], config.stream_max_age)
            .await?;
    }

    let cancel = shutdown_token();
    let (control_tx, control_rx) = watch::channel(RunState::Running);

    let catalog = PipelineCatalog::open(&bus).await?;
    tokio::spawn(supervise(
        catalog,
        pipeline_id.clone(),
        control_tx,
        cancel.clone(),
    ));

    let role_future = run_role(&config, &spec, bus, cancel.clone(), control_rx);
    tokio::pin!(role_future);

    let result = tokio::select! {
        result = &mut role_future => result,
        _ = cancel.cancelled() => {
            // Drain: the role loop stops pulling, finishes its in-flight
            // batch and returns; it gets the configured deadline to do so.
            match tokio::time::timeout(config.shutdown_timeout, &mut role_future).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    what: "worker drain".to_string(),
                    after: config.shutdown_timeout,
                }),
            }
        }
    };

    match &result {
        Ok(()) => info!(pipeline = %pipeline_id, role = %config.role, "worker exited cleanly"),
        Err(e) => error!(pipeline = %pipeline_id, role = %config.role, error = %e, "worker failed"),
    }

    result
}

async fn run_role(
    config: &WorkerConfig,
    spec: &PipelineSpec,
    bus: BusClient,
    cancel: CancellationToken,
    control: watch::Receiver<RunState>,
) -> Result<()> {
    match config.role {
        Role::Ingestor => {
            let ingestor = ingest::KafkaIngestor::new(config, spec, bus).await?;
            ingestor.run(cancel, control).await
        }
        Role::Dedup => {
            let store = dedup_store(config, &spec.id).await?;
            let runner = dedup::DedupRunner::new(config, spec, bus, store).await?;
            runner.run(cancel, control).await
        }
        Role::Join => {
            let runner = join::JoinRunner::new(config, spec, bus).await?;
            runner.run(cancel, control).await
        }
        Role::Sink => {
            let batcher = sink::build_sink(config, spec, bus).await?;
            batcher.run(cancel, control).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_form() {
        assert_eq!(serde_json::to_string(&Role::Ingestor).unwrap(), "\"ingestor\"");
        assert_eq!(Role::Join.as_str(), "join");
        assert!(Role::Dedup.is_per_topic());
        assert!(!Role::Sink.is_per_topic());
    }

    #[test]
    fn test_load_spec_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = load_spec(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigInvalid);
    }
}
