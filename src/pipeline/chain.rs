//! Ordered processor chain with dead-letter middleware.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dedup::DedupStore;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{DeadLetter, PipelineSpec, TopicSpec};
use crate::pipeline::dedup::DedupProcessor;
use crate::pipeline::filter::FilterProcessor;
use crate::pipeline::processor::{Outcome, Processor};
use crate::pipeline::transform::TransformProcessor;

/// Where rejected records go. Implemented by the bus-backed
/// [`crate::dlq::DlqWriter`]; tests substitute an in-memory sink.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, letter: &DeadLetter) -> Result<()>;
}

#[async_trait]
impl DeadLetterSink for crate::dlq::DlqWriter {
    async fn write(&self, letter: &DeadLetter) -> Result<()> {
        crate::dlq::DlqWriter::write(self, letter).await
    }
}

/// Result of pushing one record through the whole chain.
#[derive(Debug, PartialEq)]
pub enum ChainOutput {
    /// The record survived every stage.
    Emit(Value),

    /// A stage dropped the record (filter miss, duplicate). The offset
    /// advances without any downstream emission.
    Drop,

    /// The record was routed to the DLQ; the offset advances.
    DeadLettered,
}

/// Composes processors in declared order and short-circuits failures to the
/// dead-letter sink.
///
/// There is no cycle here: the DLQ is a sink-only escape captured by
/// reference, never a stage.
pub struct ProcessorChain {
    pipeline_id: String,
    role: String,
    source_stream: String,
    processors: Vec<Box<dyn Processor>>,
    dlq: Arc<dyn DeadLetterSink>,
}

impl ProcessorChain {
    pub fn new(
        pipeline_id: impl Into<String>,
        role: impl Into<String>,
        source_stream: impl Into<String>,
        processors: Vec<Box<dyn Processor>>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            role: role.into(),
            source_stream: source_stream.into(),
            processors,
            dlq,
        }
    }

    /// The dedup role's chain: `[filter?, dedup?, transform?]` in that
    /// order, per the pipeline spec.
    pub fn for_dedup_role(
        spec: &PipelineSpec,
        topic: &TopicSpec,
        source_stream: impl Into<String>,
        store: Arc<dyn DedupStore>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        let mut processors: Vec<Box<dyn Processor>> = Vec::new();

        if spec.filter.enabled {
            processors.push(Box::new(FilterProcessor::from_spec(&spec.filter)?));
        }
        if let Some(dedup_spec) = topic.dedup() {
            processors.push(Box::new(DedupProcessor::new(store, &topic.name, dedup_spec)?));
        }
        if spec.stateless_transform.enabled {
            processors.push(Box::new(TransformProcessor::from_spec(
                &spec.stateless_transform,
            )?));
        }

        Ok(Self::new(
            spec.id.clone(),
            "dedup",
            source_stream,
            processors,
            dlq,
        ))
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Push one record through the chain.
    ///
    /// `original` is the exact inbound payload; it is what a dead letter
    /// carries, regardless of how far the record got before failing.
    ///
    /// Returns `Err` when the caller must NOT advance the offset: transient
    /// failures (redeliver), dead-letter write failures (fatal), and dedup
    /// backend errors, which are dead-lettered AND redelivered so a backend
    /// blip cannot lose the first observation of a key.
    pub async fn run(&self, original: &[u8], record: Value) -> Result<ChainOutput> {
        let mut current = record;

        for processor in &self.processors {
            match processor.process(current).await {
                Outcome::Emit(next) => current = next,
                Outcome::Drop => {
                    debug!(stage = processor.name(), "record dropped");
                    return Ok(ChainOutput::Drop);
                }
                Outcome::Fail(err) => {
                    return self.handle_failure(processor.name(), original, err).await;
                }
            }
        }

        Ok(ChainOutput::Emit(current))
    }

    async fn handle_failure(
        &self,
        stage: &str,
        original: &[u8],
        err: PipelineError,
    ) -> Result<ChainOutput> {
        match err.kind() {
            ErrorKind::PoisonRecord => {
                warn!(stage, error = %err, "record rejected, routing to DLQ");
                let letter = DeadLetter::new(
                    &self.pipeline_id,
                    &self.role,
                    ErrorKind::PoisonRecord,
                    err.to_string(),
                    original,
                    &self.source_stream,
                );
                self.dlq.write(&letter).await?;

                // Dedup backend errors keep the offset where it is even
                // though the record is already dead-lettered: the backend
                // never recorded the key, so the redelivered record must be
                // observed again.
                if matches!(err, PipelineError::DedupBackend(_)) {
                    return Err(err);
                }
                Ok(ChainOutput::DeadLettered)
            }
            _ => Err(err),
        }
    }
}
