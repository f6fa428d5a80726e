//! Local process supervisor backend.
//!
//! Spawns one worker process per component on the local machine. Meant for
//! development and single-node deployments; the declarative Kubernetes
//! backend covers everything else.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{info, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::models::PipelineSpec;
use crate::orchestrator::{planned_components, ComponentHealth, Orchestrator, PipelineHealth};
use crate::runtime::Role;

/// Settings for spawning local workers.
#[derive(Debug, Clone)]
pub struct LocalOrchestratorConfig {
    /// Worker binary to execute.
    pub worker_binary: PathBuf,

    /// Where pipeline spec files are written for workers to read.
    pub config_dir: PathBuf,

    pub bus_url: String,

    pub kafka_brokers: String,

    /// Shared dedup backend handed to dedup workers, if any.
    pub redis_url: Option<String>,
}

impl Default for LocalOrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_binary: PathBuf::from("streamforge-worker"),
            config_dir: std::env::temp_dir().join("streamforge"),
            bus_url: "nats://localhost:4222".to_string(),
            kafka_brokers: "localhost:9092".to_string(),
            redis_url: None,
        }
    }
}

struct WorkerProcess {
    role: Role,
    topic: Option<String>,
    child: Child,
}

/// Process supervisor keeping one child per worker.
pub struct LocalOrchestrator {
    config: LocalOrchestratorConfig,
    workers: DashMap<String, Vec<WorkerProcess>>,
}

impl LocalOrchestrator {
    pub fn new(config: LocalOrchestratorConfig) -> Self {
        Self {
            config,
            workers: DashMap::new(),
        }
    }

    fn spec_path(&self, id: &str) -> PathBuf {
        self.config.config_dir.join(format!("{id}.json"))
    }

    fn spawn_worker(
        &self,
        spec_path: &std::path::Path,
        role: Role,
        topic: Option<&str>,
        shard: Option<u32>,
    ) -> Result<Child> {
        let mut command = Command::new(&self.config.worker_binary);
        command
            .env("ROLE", role.as_str())
            .env("PIPELINE_CONFIG_PATH", spec_path)
            .env("BUS_URL", &self.config.bus_url)
            .env("KAFKA_BROKERS", &self.config.kafka_brokers)
            .kill_on_drop(true);

        if let Some(topic) = topic {
            command.env("TOPIC", topic);
        }
        if let Some(shard) = shard {
            command.env("SHARD", shard.to_string());
        }
        if let Some(redis_url) = &self.config.redis_url {
            command.env("REDIS_URL", redis_url);
        }

        command.spawn().map_err(|e| {
            PipelineError::Orchestrator(format!("spawn {role} worker: {e}"))
        })
    }

    fn spawn_all(&self, spec: &PipelineSpec) -> Result<Vec<WorkerProcess>> {
        let spec_path = self.spec_path(&spec.id);
        let mut workers = Vec::new();

        for (role, topic, replicas) in planned_components(spec) {
            for replica in 0..replicas {
                // Dedup replicas are pinned to one subject shard each so all
                // observations of a key land on the same worker.
                let shard = match role {
                    Role::Dedup if replicas > 1 => Some(replica),
                    _ => None,
                };
                let child = self.spawn_worker(&spec_path, role, topic.as_deref(), shard)?;
                workers.push(WorkerProcess {
                    role,
                    topic: topic.clone(),
                    child,
                });
            }
        }

        Ok(workers)
    }

    async fn kill_all(&self, id: &str) -> Result<bool> {
        let Some((_, mut workers)) = self.workers.remove(id) else {
            return Ok(false);
        };

        for worker in &mut workers {
            if let Err(e) = worker.child.start_kill() {
                warn!(pipeline = %id, role = %worker.role, error = %e, "kill failed");
            }
        }
        for worker in &mut workers {
            let _ = worker.child.wait().await;
        }

        info!(pipeline = %id, count = workers.len(), "workers stopped");
        Ok(true)
    }

    fn known(&self, id: &str) -> Result<()> {
        if self.workers.contains_key(id) || self.spec_path(id).exists() {
            Ok(())
        } else {
            Err(PipelineError::PipelineNotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    #[instrument(skip(self, spec), fields(pipeline = %spec.id))]
    async fn setup_pipeline(&self, spec: &PipelineSpec) -> Result<()> {
        std::fs::create_dir_all(&self.config.config_dir).map_err(|e| {
            PipelineError::Orchestrator(format!("create config dir: {e}"))
        })?;

        let spec_path = self.spec_path(&spec.id);
        let payload = serde_json::to_vec_pretty(spec)
            .map_err(|e| PipelineError::Orchestrator(format!("encode spec: {e}")))?;
        std::fs::write(&spec_path, payload)
            .map_err(|e| PipelineError::Orchestrator(format!("write spec file: {e}")))?;

        let workers = self.spawn_all(spec)?;
        info!(pipeline = %spec.id, count = workers.len(), "workers spawned");
        self.workers.insert(spec.id.clone(), workers);
        Ok(())
    }

    async fn stop_pipeline(&self, id: &str) -> Result<()> {
        self.known(id)?;
        self.kill_all(id).await?;
        Ok(())
    }

    async fn pause_pipeline(&self, id: &str) -> Result<()> {
        // Workers observe the Pausing status through the catalog and hold
        // their pull loops; processes stay up so consumers and buffers
        // survive.
        self.known(id)
    }

    async fn resume_pipeline(&self, id: &str) -> Result<()> {
        self.known(id)?;

        // After a stop the processes are gone; respawn them from the spec
        // file. After a pause they are still alive and this is a no-op.
        if !self.workers.contains_key(id) {
            let spec = crate::runtime::load_spec(&self.spec_path(id))?;
            let workers = self.spawn_all(&spec)?;
            self.workers.insert(spec.id.clone(), workers);
        }
        Ok(())
    }

    async fn terminate_pipeline(&self, id: &str) -> Result<()> {
        let had_workers = self.kill_all(id).await?;

        let spec_path = self.spec_path(id);
        let had_spec = spec_path.exists();
        if had_spec {
            if let Err(e) = std::fs::remove_file(&spec_path) {
                warn!(pipeline = %id, error = %e, "failed to remove spec file");
            }
        }

        if !had_workers && !had_spec {
            return Err(PipelineError::PipelineNotFound(id.to_string()));
        }
        info!(pipeline = %id, "pipeline terminated");
        Ok(())
    }

    async fn check_component_health(&self, id: &str) -> Result<PipelineHealth> {
        self.known(id)?;

        let mut components = Vec::new();
        if let Some(mut workers) = self.workers.get_mut(id) {
            for worker in workers.iter_mut() {
                let alive = matches!(worker.child.try_wait(), Ok(None));
                components.push(ComponentHealth {
                    role: worker.role,
                    topic: worker.topic.clone(),
                    ready: alive as u32,
                    desired: 1,
                    message: if alive { "running" } else { "exited" }.to_string(),
                });
            }
        }

        Ok(PipelineHealth::from_components(id, components))
    }
}
