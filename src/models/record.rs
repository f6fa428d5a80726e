//! Record envelopes flowing between roles.
//!
//! The ingestor wraps every Kafka record in a [`SourceRecord`] before it is
//! published to the bus; the source coordinates carried in the envelope feed
//! idempotent downstream publishes and the dead-letter `source_stream` field.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Envelope published to `<pid>.in.<topic>` subjects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    /// Source Kafka topic.
    pub topic: String,

    /// Source partition.
    pub partition: i32,

    /// Source offset within the partition.
    pub offset: i64,

    /// When the ingestor accepted the record.
    pub ingested_at: DateTime<Utc>,

    /// The record body as parsed JSON.
    pub payload: serde_json::Value,
}

impl SourceRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            ingested_at: Utc::now(),
            payload,
        }
    }

    /// Stable publish id for idempotent bus publishes of this record.
    pub fn publish_id(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// Error metadata attached to a dead letter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Record published to `<pid>.dlq` when a processor rejects its input.
///
/// `original` is the base64 of the exact inbound payload, so a dead letter
/// can always be replayed against a fixed pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub pipeline_id: String,
    pub role: String,
    pub error: DeadLetterError,
    pub original: String,
    pub source_stream: String,
    pub ts: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        pipeline_id: impl Into<String>,
        role: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        original: &[u8],
        source_stream: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            role: role.into(),
            error: DeadLetterError {
                kind,
                message: message.into(),
            },
            original: base64::engine::general_purpose::STANDARD.encode(original),
            source_stream: source_stream.into(),
            ts: Utc::now(),
        }
    }

    /// Decode the original payload bytes.
    pub fn original_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.original)
    }
}
