//! Stateless pipeline manager.
//!
//! All durable state lives in the KV catalog; the manager validates
//! requested operations against the lifecycle table, persists the
//! transitional status and drives the orchestrator. Orchestrator failures
//! move the pipeline to `Failed`; `NotFound` from the backend surfaces as
//! `PipelineNotFound` without touching state.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::catalog::PipelineCatalog;
use crate::error::{PipelineError, Result};
use crate::lifecycle::{validate_operation, OperationOutcome};
use crate::models::pipeline::normalize_id;
use crate::models::{PipelineOperation, PipelineSpec, PipelineStatus};
use crate::orchestrator::{Orchestrator, PipelineHealth};

/// Control-plane entry point for pipeline CRUD and lifecycle operations.
#[derive(Clone)]
pub struct PipelineManager {
    catalog: PipelineCatalog,
    orchestrator: Arc<dyn Orchestrator>,
}

impl PipelineManager {
    pub fn new(catalog: PipelineCatalog, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            catalog,
            orchestrator,
        }
    }

    /// Create a pipeline: validate, persist, materialize workers, mark
    /// `Created`.
    #[instrument(skip(self, spec), fields(pipeline = %spec.id))]
    pub async fn create(&self, mut spec: PipelineSpec) -> Result<PipelineSpec> {
        spec.id = normalize_id(&spec.id);
        spec.validate()?;
        spec.status = Default::default();

        self.catalog.create(&spec).await?;

        if let Err(e) = self.orchestrator.setup_pipeline(&spec).await {
            error!(pipeline = %spec.id, error = %e, "setup failed, marking pipeline failed");
            let _ = self
                .catalog
                .update_status(&spec.id, PipelineStatus::Failed)
                .await;
            return Err(e);
        }

        info!(pipeline = %spec.id, "pipeline created");
        Ok(spec)
    }

    /// Fetch one pipeline.
    pub async fn get(&self, id: &str) -> Result<PipelineSpec> {
        self.catalog.get(id).await
    }

    /// List all pipelines.
    pub async fn list(&self) -> Result<Vec<PipelineSpec>> {
        self.catalog.list().await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.apply(id, PipelineOperation::Pause).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.apply(id, PipelineOperation::Resume).await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.apply(id, PipelineOperation::Stop).await
    }

    /// Terminate is a kill switch: it takes precedence over any pending
    /// pause/resume/stop, which the orchestrator clears before acting.
    pub async fn terminate(&self, id: &str) -> Result<()> {
        self.apply(id, PipelineOperation::Terminate).await
    }

    /// Per-component health, straight from the orchestrator.
    pub async fn get_health(&self, id: &str) -> Result<PipelineHealth> {
        self.catalog.get(id).await?;
        self.orchestrator.check_component_health(id).await
    }

    #[instrument(skip(self), fields(pipeline = %id, operation = %operation))]
    async fn apply(&self, id: &str, operation: PipelineOperation) -> Result<()> {
        let spec = self.catalog.get(id).await?;

        let target = match validate_operation(spec.status.overall, operation)? {
            OperationOutcome::Apply(target) => target,
            OperationOutcome::Noop => {
                info!(pipeline = %id, operation = %operation, "already in requested state");
                return Ok(());
            }
        };

        self.catalog.update_status(id, target).await?;

        let result = match operation {
            PipelineOperation::Pause => self.orchestrator.pause_pipeline(id).await,
            PipelineOperation::Resume => self.orchestrator.resume_pipeline(id).await,
            PipelineOperation::Stop => self.orchestrator.stop_pipeline(id).await,
            PipelineOperation::Terminate => self.orchestrator.terminate_pipeline(id).await,
            PipelineOperation::Create | PipelineOperation::Start => Ok(()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e @ PipelineError::PipelineNotFound(_)) => Err(e),
            Err(e) => {
                error!(pipeline = %id, error = %e, "orchestrator failed, marking pipeline failed");
                let _ = self.catalog.update_status(id, PipelineStatus::Failed).await;
                Err(PipelineError::Orchestrator(e.to_string()))
            }
        }
    }

    /// One reconcile tick: fold orchestrator-reported health into the
    /// transitional states and finish terminations.
    pub async fn reconcile(&self) -> Result<()> {
        for spec in self.catalog.list().await? {
            if let Err(e) = self.reconcile_one(&spec).await {
                warn!(pipeline = %spec.id, error = %e, "reconcile failed");
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, spec: &PipelineSpec) -> Result<()> {
        use PipelineStatus::*;

        let id = &spec.id;
        match spec.status.overall {
            Pausing => {
                // Workers hold their pull loops as soon as they observe the
                // transitional status; one tick later the pause has settled.
                self.catalog.update_status(id, Paused).await?;
            }
            Resuming => {
                let health = self.orchestrator.check_component_health(id).await?;
                if health.healthy {
                    self.catalog.update_status(id, Running).await?;
                }
            }
            Stopping => {
                let health = self.orchestrator.check_component_health(id).await?;
                if health.all_stopped() {
                    self.catalog.update_status(id, Stopped).await?;
                }
            }
            Created => {
                let health = self.orchestrator.check_component_health(id).await?;
                if health.healthy {
                    self.catalog.update_status(id, Running).await?;
                }
            }
            Terminating => {
                match self.orchestrator.check_component_health(id).await {
                    Ok(health) if !health.all_stopped() => {}
                    // Workers gone (or the backend no longer knows the
                    // pipeline): the termination has settled.
                    _ => {
                        self.catalog.update_status(id, Terminated).await?;
                        self.catalog.delete(id).await?;
                        info!(pipeline = %id, "termination settled, catalog entry removed");
                    }
                }
            }
            Running => {
                if let Ok(health) = self.orchestrator.check_component_health(id).await {
                    if !health.healthy {
                        warn!(pipeline = %id, "running pipeline unhealthy, marking failed");
                        self.catalog.update_status(id, Failed).await?;
                    }
                }
            }
            Paused | Stopped | Terminated | Failed => {}
        }

        Ok(())
    }
}
