//! Key-value bucket wrapper with compare-and-swap updates.

use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PipelineError, Result};

/// A value read together with its revision, for CAS writes.
#[derive(Debug, Clone)]
pub struct KvEntry<T> {
    pub value: T,
    pub revision: u64,
}

/// Thin wrapper over a bus key-value bucket.
#[derive(Clone)]
pub struct KvBucket {
    store: kv::Store,
}

impl KvBucket {
    pub(crate) fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Read a raw value.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.store
            .get(key)
            .await
            .map_err(|e| PipelineError::Kv(format!("get `{key}`: {e}")))
    }

    /// Read and deserialize a JSON value together with its revision.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<KvEntry<T>>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| PipelineError::Kv(format!("entry `{key}`: {e}")))?;

        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => {
                let value = serde_json::from_slice(&entry.value)
                    .map_err(|e| PipelineError::Kv(format!("decode `{key}`: {e}")))?;
                Ok(Some(KvEntry {
                    value,
                    revision: entry.revision,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Create a key that must not already exist.
    pub async fn create_json<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| PipelineError::Kv(format!("encode `{key}`: {e}")))?;
        self.store
            .create(key, payload.into())
            .await
            .map_err(|e| PipelineError::Kv(format!("create `{key}`: {e}")))
    }

    /// Unconditional write.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| PipelineError::Kv(format!("encode `{key}`: {e}")))?;
        self.store
            .put(key, payload.into())
            .await
            .map_err(|e| PipelineError::Kv(format!("put `{key}`: {e}")))
    }

    /// Compare-and-swap write against the revision read earlier.
    pub async fn update_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        revision: u64,
    ) -> Result<u64> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| PipelineError::Kv(format!("encode `{key}`: {e}")))?;
        self.store
            .update(key, payload.into(), revision)
            .await
            .map_err(|e| PipelineError::Kv(format!("update `{key}` @{revision}: {e}")))
    }

    /// Delete a key. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .map_err(|e| PipelineError::Kv(format!("delete `{key}`: {e}")))
    }

    /// List all keys currently present in the bucket.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let keys = self
            .store
            .keys()
            .await
            .map_err(|e| PipelineError::Kv(format!("keys: {e}")))?;
        keys.try_collect()
            .await
            .map_err(|e| PipelineError::Kv(format!("keys: {e}")))
    }
}
