//! Batch reads from durable pull consumers.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// One message pulled from the bus.
pub struct BusMessage {
    inner: jetstream::Message,
}

impl BusMessage {
    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    pub fn subject(&self) -> &str {
        self.inner.subject.as_str()
    }

    /// Position of this message within its stream. Stable across
    /// redeliveries, which makes it usable as an idempotency key for
    /// downstream publishes.
    pub fn stream_sequence(&self) -> u64 {
        self.inner
            .info()
            .map(|info| info.stream_sequence)
            .unwrap_or(0)
    }
}

/// Reader side of a durable pull consumer.
pub struct BatchReader {
    stream: String,
    consumer: PullConsumer,
}

impl BatchReader {
    pub(crate) fn new(stream: String, consumer: PullConsumer) -> Self {
        Self { stream, consumer }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Pull up to `max_n` messages, waiting at most `max_wait`.
    ///
    /// Returns an empty batch after `max_wait` when nothing arrived; callers
    /// loop on that rather than treating it as an error.
    pub async fn pull(&self, max_n: usize, max_wait: Duration) -> Result<Batch> {
        let messages = self
            .consumer
            .fetch()
            .max_messages(max_n)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| PipelineError::StreamUnavailable {
                stream: self.stream.clone(),
                message: format!("fetch failed: {e}"),
            })?;

        let collected: Vec<_> = messages.collect().await;

        let mut batch = Vec::with_capacity(collected.len());
        for item in collected {
            match item {
                Ok(message) => batch.push(BusMessage { inner: message }),
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "dropped message from fetch");
                }
            }
        }

        debug!(stream = %self.stream, count = batch.len(), "pulled batch");
        Ok(Batch { messages: batch })
    }
}

/// A pulled batch whose acknowledgement is a barrier.
///
/// `ack` acknowledges every contained message; until it is called the
/// consumer's offset does not advance past any of them. `nak` asks the
/// server to redeliver the whole batch.
pub struct Batch {
    messages: Vec<BusMessage>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[BusMessage] {
        &self.messages
    }

    /// Acknowledge all messages in the batch.
    pub async fn ack(self) -> Result<()> {
        for message in &self.messages {
            message
                .inner
                .ack()
                .await
                .map_err(|e| PipelineError::StreamUnavailable {
                    stream: message.subject().to_string(),
                    message: format!("ack failed: {e}"),
                })?;
        }
        Ok(())
    }

    /// Request redelivery of all messages in the batch.
    pub async fn nak(self) -> Result<()> {
        for message in &self.messages {
            message
                .inner
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| PipelineError::StreamUnavailable {
                    stream: message.subject().to_string(),
                    message: format!("nak failed: {e}"),
                })?;
        }
        Ok(())
    }
}
