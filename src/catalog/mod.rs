//! Persisted pipeline catalog.
//!
//! The catalog is a bus KV bucket (`pipelines`): key = lowercased pipeline
//! id, value = UTF-8 JSON of the spec. Status writes are compare-and-swap on
//! the entry revision; a lost race is re-read and retried once before being
//! surfaced as transient.

use tracing::{debug, info, instrument};

use crate::bus::{BusClient, KvBucket};
use crate::error::{PipelineError, Result};
use crate::models::pipeline::normalize_id;
use crate::models::{PipelineSpec, PipelineStatus};

/// Name of the catalog bucket.
pub const CATALOG_BUCKET: &str = "pipelines";

/// Catalog of pipeline specs, shared by managers and workers.
#[derive(Clone)]
pub struct PipelineCatalog {
    kv: KvBucket,
}

impl PipelineCatalog {
    /// Open (or create) the catalog bucket.
    pub async fn open(bus: &BusClient) -> Result<Self> {
        Ok(Self {
            kv: bus.ensure_kv(CATALOG_BUCKET).await?,
        })
    }

    /// Persist a new spec. Ids are unique case-insensitively; creating an
    /// existing id fails.
    #[instrument(skip(self, spec), fields(pipeline = %spec.id))]
    pub async fn create(&self, spec: &PipelineSpec) -> Result<()> {
        let key = normalize_id(&spec.id);

        if self.kv.get(&key).await?.is_some() {
            return Err(PipelineError::ConfigInvalid(format!(
                "pipeline `{key}` already exists"
            )));
        }

        self.kv.create_json(&key, spec).await.map_err(|e| {
            // A concurrent create beat us to the key.
            PipelineError::ConfigInvalid(format!("pipeline `{key}` already exists: {e}"))
        })?;

        info!(pipeline = %key, "pipeline persisted");
        Ok(())
    }

    /// Fetch a spec by id.
    pub async fn get(&self, id: &str) -> Result<PipelineSpec> {
        let key = normalize_id(id);
        self.kv
            .get_json::<PipelineSpec>(&key)
            .await?
            .map(|entry| entry.value)
            .ok_or_else(|| PipelineError::PipelineNotFound(key))
    }

    /// Update the overall status with compare-and-swap, retrying one lost
    /// race before reporting the write as transient.
    #[instrument(skip(self), fields(pipeline = %id, status = %status))]
    pub async fn update_status(&self, id: &str, status: PipelineStatus) -> Result<PipelineSpec> {
        let key = normalize_id(id);

        for attempt in 0..2 {
            let entry = self
                .kv
                .get_json::<PipelineSpec>(&key)
                .await?
                .ok_or_else(|| PipelineError::PipelineNotFound(key.clone()))?;

            let mut spec = entry.value;
            spec.set_status(status);

            match self.kv.update_json(&key, &spec, entry.revision).await {
                Ok(_) => {
                    debug!(pipeline = %key, status = %status, "status updated");
                    return Ok(spec);
                }
                Err(e) if attempt == 0 => {
                    debug!(pipeline = %key, error = %e, "status CAS lost, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("update_status loop always returns")
    }

    /// Remove a pipeline. Called once a pipeline settles in `Terminated`.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = normalize_id(id);
        self.kv.delete(&key).await?;
        info!(pipeline = %key, "pipeline removed from catalog");
        Ok(())
    }

    /// All specs currently in the catalog. Keys deleted mid-listing are
    /// skipped rather than failing the listing.
    pub async fn list(&self) -> Result<Vec<PipelineSpec>> {
        let mut specs = Vec::new();
        for key in self.kv.keys().await? {
            if let Some(entry) = self.kv.get_json::<PipelineSpec>(&key).await? {
                specs.push(entry.value);
            }
        }
        Ok(specs)
    }
}
