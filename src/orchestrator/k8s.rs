//! Declarative Kubernetes backend.
//!
//! Each worker component becomes a `Deployment` labelled with the pipeline
//! id and role; the pipeline spec travels in a `ConfigMap` mounted into
//! every pod. Pause/resume scale replicas to zero and back; terminate
//! deletes everything the backend provisioned. The requested operation is
//! recorded in the `streamforge.io/operation` annotation, and terminate
//! clears any pending operation before setting its own.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, Result};
use crate::models::PipelineSpec;
use crate::orchestrator::{
    planned_components, ComponentHealth, Orchestrator, PipelineHealth, OPERATION_ANNOTATION,
};
use crate::runtime::Role;

/// Annotation recording the replica count to restore on resume.
const REPLICAS_ANNOTATION: &str = "streamforge.io/replicas";

const PIPELINE_LABEL: &str = "streamforge.io/pipeline";
const ROLE_LABEL: &str = "streamforge.io/role";
const TOPIC_LABEL: &str = "streamforge.io/topic";

/// Settings for the declarative backend.
#[derive(Debug, Clone)]
pub struct K8sOrchestratorConfig {
    pub namespace: String,
    pub worker_image: String,
    pub bus_url: String,
    pub kafka_brokers: String,
    pub redis_url: Option<String>,
}

impl Default for K8sOrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "streamforge".to_string(),
            worker_image: "streamforge/worker:latest".to_string(),
            bus_url: "nats://nats:4222".to_string(),
            kafka_brokers: "kafka:9092".to_string(),
            redis_url: None,
        }
    }
}

/// Kubernetes-backed orchestrator.
pub struct K8sOrchestrator {
    client: kube::Client,
    config: K8sOrchestratorConfig,
}

impl K8sOrchestrator {
    /// Connect using the ambient kubeconfig / in-cluster credentials.
    pub async fn new(config: K8sOrchestratorConfig) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("kubernetes client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: kube::Client, config: K8sOrchestratorConfig) -> Self {
        Self { client, config }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn configmaps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn selector(id: &str) -> String {
        format!("{PIPELINE_LABEL}={id}")
    }

    fn configmap_name(id: &str) -> String {
        format!("sf-{}-spec", sanitize(id))
    }

    fn deployment_name(id: &str, role: Role, topic: Option<&str>, shard: Option<u32>) -> String {
        let mut name = format!("sf-{}-{}", sanitize(id), role.as_str());
        if let Some(topic) = topic {
            name.push('-');
            name.push_str(&sanitize(topic));
        }
        if let Some(shard) = shard {
            name.push('-');
            name.push_str(&shard.to_string());
        }
        name
    }

    fn worker_env(
        &self,
        role: Role,
        topic: Option<&str>,
        shard: Option<u32>,
    ) -> Vec<serde_json::Value> {
        let mut env = vec![
            json!({"name": "ROLE", "value": role.as_str()}),
            json!({"name": "PIPELINE_CONFIG_PATH", "value": "/etc/streamforge/pipeline.json"}),
            json!({"name": "BUS_URL", "value": self.config.bus_url}),
            json!({"name": "KAFKA_BROKERS", "value": self.config.kafka_brokers}),
        ];
        if let Some(topic) = topic {
            env.push(json!({"name": "TOPIC", "value": topic}));
        }
        if let Some(shard) = shard {
            env.push(json!({"name": "SHARD", "value": shard.to_string()}));
        }
        if let Some(redis_url) = &self.config.redis_url {
            env.push(json!({"name": "REDIS_URL", "value": redis_url}));
        }
        env
    }

    fn deployment_manifest(
        &self,
        spec: &PipelineSpec,
        role: Role,
        topic: Option<&str>,
        shard: Option<u32>,
        replicas: u32,
    ) -> serde_json::Value {
        let name = Self::deployment_name(&spec.id, role, topic, shard);
        let mut labels = json!({
            "app.kubernetes.io/managed-by": "streamforge",
            PIPELINE_LABEL: spec.id,
            ROLE_LABEL: role.as_str(),
        });
        if let Some(topic) = topic {
            labels[TOPIC_LABEL] = json!(sanitize(topic));
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": self.config.namespace,
                "labels": labels,
                "annotations": {
                    OPERATION_ANNOTATION: "create",
                    REPLICAS_ANNOTATION: replicas.to_string(),
                },
            },
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app.kubernetes.io/name": name}},
                "template": {
                    "metadata": {"labels": {"app.kubernetes.io/name": name}},
                    "spec": {
                        "containers": [{
                            "name": "worker",
                            "image": self.config.worker_image,
                            "env": self.worker_env(role, topic, shard),
                            "volumeMounts": [{
                                "name": "pipeline-spec",
                                "mountPath": "/etc/streamforge",
                                "readOnly": true,
                            }],
                        }],
                        "volumes": [{
                            "name": "pipeline-spec",
                            "configMap": {"name": Self::configmap_name(&spec.id)},
                        }],
                        "terminationGracePeriodSeconds": 45,
                    },
                },
            },
        })
    }

    async fn list_pipeline_deployments(&self, id: &str) -> Result<Vec<Deployment>> {
        let deployments = self
            .deployments()
            .list(&ListParams::default().labels(&Self::selector(id)))
            .await
            .map_err(|e| map_kube_error(id, e))?;
        Ok(deployments.items)
    }

    /// Annotate every deployment of a pipeline with the pending operation,
    /// optionally scaling it at the same time.
    async fn annotate_and_scale(
        &self,
        id: &str,
        operation: Option<&str>,
        replicas: Option<ReplicaTarget>,
    ) -> Result<()> {
        let deployments = self.list_pipeline_deployments(id).await?;
        if deployments.is_empty() {
            return Err(PipelineError::PipelineNotFound(id.to_string()));
        }

        let api = self.deployments();
        for deployment in deployments {
            let name = deployment.name_any();

            let replica_count = match replicas {
                None => None,
                Some(ReplicaTarget::Zero) => Some(0),
                Some(ReplicaTarget::Restore) => Some(
                    deployment
                        .annotations()
                        .get(REPLICAS_ANNOTATION)
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(1),
                ),
            };

            let mut patch = json!({"metadata": {"annotations": {OPERATION_ANNOTATION: operation}}});
            if let Some(count) = replica_count {
                patch["spec"] = json!({"replicas": count});
            }

            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| map_kube_error(id, e))?;
            debug!(deployment = %name, operation = ?operation, replicas = ?replica_count, "patched");
        }

        Ok(())
    }
}

enum ReplicaTarget {
    Zero,
    Restore,
}

fn sanitize(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn map_kube_error(id: &str, error: kube::Error) -> PipelineError {
    if let kube::Error::Api(response) = &error {
        if response.code == 404 {
            return PipelineError::PipelineNotFound(id.to_string());
        }
    }
    PipelineError::Orchestrator(error.to_string())
}

#[async_trait]
impl Orchestrator for K8sOrchestrator {
    #[instrument(skip(self, spec), fields(pipeline = %spec.id))]
    async fn setup_pipeline(&self, spec: &PipelineSpec) -> Result<()> {
        let params = PatchParams::apply("streamforge").force();

        let spec_json = serde_json::to_string_pretty(spec)
            .map_err(|e| PipelineError::Orchestrator(format!("encode spec: {e}")))?;
        let configmap_name = Self::configmap_name(&spec.id);
        let configmap = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": configmap_name,
                "namespace": self.config.namespace,
                "labels": {PIPELINE_LABEL: spec.id},
            },
            "data": {"pipeline.json": spec_json},
        });
        self.configmaps()
            .patch(&configmap_name, &params, &Patch::Apply(&configmap))
            .await
            .map_err(|e| map_kube_error(&spec.id, e))?;

        let api = self.deployments();
        for (role, topic, replicas) in planned_components(spec) {
            // Dedup replicas become one single-replica deployment per shard
            // so each worker can be pinned to its subject shard.
            let shards: Vec<(Option<u32>, u32)> = match role {
                Role::Dedup if replicas > 1 => {
                    (0..replicas).map(|shard| (Some(shard), 1)).collect()
                }
                _ => vec![(None, replicas)],
            };

            for (shard, deployment_replicas) in shards {
                let manifest =
                    self.deployment_manifest(spec, role, topic.as_deref(), shard, deployment_replicas);
                let name = Self::deployment_name(&spec.id, role, topic.as_deref(), shard);
                api.patch(&name, &params, &Patch::Apply(&manifest))
                    .await
                    .map_err(|e| map_kube_error(&spec.id, e))?;
                debug!(deployment = %name, "applied");
            }
        }

        info!(pipeline = %spec.id, "pipeline materialized");
        Ok(())
    }

    async fn stop_pipeline(&self, id: &str) -> Result<()> {
        self.annotate_and_scale(id, Some("stop"), Some(ReplicaTarget::Zero))
            .await
    }

    async fn pause_pipeline(&self, id: &str) -> Result<()> {
        self.annotate_and_scale(id, Some("pause"), Some(ReplicaTarget::Zero))
            .await
    }

    async fn resume_pipeline(&self, id: &str) -> Result<()> {
        self.annotate_and_scale(id, Some("resume"), Some(ReplicaTarget::Restore))
            .await
    }

    async fn terminate_pipeline(&self, id: &str) -> Result<()> {
        // Kill switch: clear whatever operation is pending, then record
        // terminate before tearing the resources down.
        self.annotate_and_scale(id, None, None).await?;
        self.annotate_and_scale(id, Some("terminate"), Some(ReplicaTarget::Zero))
            .await?;

        let api = self.deployments();
        for deployment in self.list_pipeline_deployments(id).await? {
            let name = deployment.name_any();
            if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
                warn!(deployment = %name, error = %e, "delete failed");
            }
        }

        let configmap_name = Self::configmap_name(id);
        if let Err(e) = self
            .configmaps()
            .delete(&configmap_name, &DeleteParams::default())
            .await
        {
            warn!(configmap = %configmap_name, error = %e, "delete failed");
        }

        info!(pipeline = %id, "pipeline torn down");
        Ok(())
    }

    async fn check_component_health(&self, id: &str) -> Result<PipelineHealth> {
        let deployments = self.list_pipeline_deployments(id).await?;
        if deployments.is_empty() {
            return Err(PipelineError::PipelineNotFound(id.to_string()));
        }

        let mut components = Vec::new();
        for deployment in deployments {
            let labels = deployment.labels();
            let role = match labels.get(ROLE_LABEL).map(String::as_str) {
                Some("ingestor") => Role::Ingestor,
                Some("dedup") => Role::Dedup,
                Some("join") => Role::Join,
                Some("sink") => Role::Sink,
                other => {
                    warn!(deployment = %deployment.name_any(), role = ?other, "unknown role label");
                    continue;
                }
            };

            let desired = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1)
                .max(0) as u32;
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0)
                .max(0) as u32;

            components.push(ComponentHealth {
                role,
                topic: labels.get(TOPIC_LABEL).cloned(),
                ready,
                desired,
                message: format!("{ready}/{desired} ready"),
            });
        }

        Ok(PipelineHealth::from_components(id, components))
    }
}
