//! The per-record processor contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;

/// Result of pushing one record through a processor.
#[derive(Debug)]
pub enum Outcome {
    /// Forward the (possibly rewritten) record to the next stage.
    Emit(Value),

    /// Silently discard the record; the offset still advances.
    Drop,

    /// The record could not be processed. The chain decides between
    /// dead-lettering and redelivery based on the error kind.
    Fail(PipelineError),
}

/// A stage transforming one record into 0..1 records.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable stage name used in logs and dead-letter metadata.
    fn name(&self) -> &'static str;

    async fn process(&self, record: Value) -> Outcome;
}
