//! Orchestrator contract.
//!
//! The control plane materializes and tears down worker processes through
//! this interface. Two backends ship: a local process supervisor and a
//! declarative Kubernetes backend. Orchestrator `NotFound` maps to
//! `PipelineNotFound`; every other backend failure bubbles as
//! `Orchestrator` and moves the pipeline to `Failed`.

pub mod k8s;
pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::models::PipelineSpec;
use crate::runtime::Role;

pub use k8s::K8sOrchestrator;
pub use local::LocalOrchestrator;

/// Operations a declarative backend records as the pipeline's pending
/// operation annotation. Terminate is a kill switch: it clears any of the
/// others before being set.
pub const OPERATION_ANNOTATION: &str = "streamforge.io/operation";

/// Health of one worker component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub role: Role,

    /// Source topic for per-topic roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Workers currently alive/ready.
    pub ready: u32,

    /// Workers requested.
    pub desired: u32,

    pub message: String,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.ready >= self.desired
    }
}

/// Aggregated pipeline health.
///
/// Never carries record contents; the last error is kind and timestamp
/// only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineHealth {
    pub pipeline_id: String,
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl PipelineHealth {
    pub fn from_components(pipeline_id: impl Into<String>, components: Vec<ComponentHealth>) -> Self {
        let healthy = !components.is_empty() && components.iter().all(|c| c.is_healthy());
        Self {
            pipeline_id: pipeline_id.into(),
            healthy,
            components,
            last_error_kind: None,
            last_error_at: None,
        }
    }

    /// Whether every component has fully stopped.
    pub fn all_stopped(&self) -> bool {
        self.components.iter().all(|c| c.ready == 0)
    }
}

/// Materializes and tears down the worker processes of a pipeline.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Bring up every worker the spec calls for.
    async fn setup_pipeline(&self, spec: &PipelineSpec) -> Result<()>;

    /// Stop workers, keeping durable consumers and in-flight state.
    async fn stop_pipeline(&self, id: &str) -> Result<()>;

    /// Suspend pulling without tearing anything down.
    async fn pause_pipeline(&self, id: &str) -> Result<()>;

    /// Re-enter the pulling loop after a pause or stop.
    async fn resume_pipeline(&self, id: &str) -> Result<()>;

    /// Kill switch: tear down workers and whatever the backend provisioned.
    /// Pending create/pause/resume/stop requests are cleared first.
    async fn terminate_pipeline(&self, id: &str) -> Result<()>;

    /// Report per-component health.
    async fn check_component_health(&self, id: &str) -> Result<PipelineHealth>;
}

/// The worker deployments a spec expands to: per-topic roles for every
/// topic, one joiner when two topics are joined, one sink.
pub fn planned_components(spec: &PipelineSpec) -> Vec<(Role, Option<String>, u32)> {
    let mut components = Vec::new();
    for topic in &spec.source.topics {
        components.push((Role::Ingestor, Some(topic.name.clone()), topic.replicas));
        components.push((Role::Dedup, Some(topic.name.clone()), topic.replicas));
    }
    if spec.has_join() {
        components.push((Role::Join, None, 1));
    }
    components.push((Role::Sink, None, 1));
    components
}
