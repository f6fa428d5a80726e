//! Dedup stage of the processor chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::dedup::{DedupStore, Observation};
use crate::error::Result;
use crate::models::DedupSpec;
use crate::pipeline::path::JsonPath;
use crate::pipeline::processor::{Outcome, Processor};

/// Drops records whose dedup key was already observed within the window.
pub struct DedupProcessor {
    store: Arc<dyn DedupStore>,
    key_path: JsonPath,
    topic: String,
    window: Duration,
}

impl DedupProcessor {
    /// Build from a topic's dedup spec. The topic name is folded into the
    /// store key so two topics deduplicating on the same field stay
    /// independent.
    pub fn new(store: Arc<dyn DedupStore>, topic: impl Into<String>, spec: &DedupSpec) -> Result<Self> {
        Ok(Self {
            store,
            key_path: JsonPath::compile(&spec.key_path)?,
            topic: topic.into(),
            window: spec.window(),
        })
    }

    fn store_key(&self, key_bytes: &[u8]) -> Vec<u8> {
        let mut composed = Vec::with_capacity(self.topic.len() + 1 + key_bytes.len());
        composed.extend_from_slice(self.topic.as_bytes());
        composed.push(0x1f);
        composed.extend_from_slice(key_bytes);
        composed
    }
}

#[async_trait]
impl Processor for DedupProcessor {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn process(&self, record: Value) -> Outcome {
        let key_bytes = match self.key_path.key_bytes(&record) {
            Ok(bytes) => bytes,
            Err(e) => return Outcome::Fail(e),
        };

        match self.store.observe(&self.store_key(&key_bytes), self.window).await {
            Ok(Observation::FirstSeen) => Outcome::Emit(record),
            Ok(Observation::Duplicate) => Outcome::Drop,
            Err(e) => Outcome::Fail(e),
        }
    }
}
