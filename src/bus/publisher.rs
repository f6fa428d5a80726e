//! Batch publishes with an all-or-report contract.

use bytes::Bytes;
use tracing::{debug, error};

use crate::bus::client::BusClient;
use crate::error::{PipelineError, Result};

/// One payload headed for the bus.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,

    /// Idempotency id; retried publishes with the same id are collapsed by
    /// the server within the stream's duplicate window.
    pub publish_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            publish_id: None,
        }
    }

    pub fn with_publish_id(mut self, id: impl Into<String>) -> Self {
        self.publish_id = Some(id.into());
        self
    }
}

/// Writer side of an output stream.
///
/// Publishes a batch and waits for every server ack before reporting
/// success. If a publish fails after some succeeded, the error carries how
/// many made it so the caller can retry the batch idempotently.
#[derive(Clone)]
pub struct BatchWriter {
    bus: BusClient,
}

impl BatchWriter {
    pub fn new(bus: BusClient) -> Self {
        Self { bus }
    }

    /// Publish every message, in order, awaiting each server ack.
    pub async fn publish_all(&self, messages: &[OutboundMessage]) -> Result<()> {
        let total = messages.len();

        for (index, message) in messages.iter().enumerate() {
            let result = self
                .bus
                .publish_with_id(
                    &message.subject,
                    message.payload.clone(),
                    message.publish_id.as_deref(),
                )
                .await;

            if let Err(e) = result {
                if index == 0 {
                    return Err(e);
                }
                error!(
                    subject = %message.subject,
                    published = index,
                    total,
                    error = %e,
                    "batch publish failed mid-way"
                );
                return Err(PipelineError::PartialPublish {
                    published: index,
                    total,
                });
            }
        }

        debug!(count = total, "batch published");
        Ok(())
    }
}
