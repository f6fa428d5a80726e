//! Dead-letter queue writer and reader.
//!
//! Every record a processor rejects lands on the pipeline's `<pid>.dlq`
//! stream with error metadata and the base64 of the original payload. The
//! writer is captured by the chain middleware; the reader pages through a
//! pipeline's dead letters without touching any durable consumer.

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use futures::StreamExt;
use tracing::{error, instrument, warn};

use crate::bus::BusClient;
use crate::error::{PipelineError, Result};
use crate::models::{topology, DeadLetter};

/// Appends dead letters to the pipeline's DLQ stream.
///
/// A failed DLQ write is fatal for the worker: silently dropping a poisoned
/// record would break the invariant that every non-emitted record is
/// accounted for.
#[derive(Clone)]
pub struct DlqWriter {
    bus: BusClient,
    subject: String,
}

impl DlqWriter {
    pub fn new(bus: BusClient, pipeline_id: &str) -> Self {
        let stream = topology::dlq_stream(pipeline_id);
        Self {
            bus,
            subject: topology::subject(&stream, 0),
        }
    }

    #[instrument(skip(self, letter), fields(pipeline = %letter.pipeline_id, role = %letter.role))]
    pub async fn write(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_vec(letter)
            .map_err(|e| PipelineError::DlqWrite(format!("encode dead letter: {e}")))?;

        self.bus
            .publish(&self.subject, payload.into())
            .await
            .map_err(|e| {
                error!(error = %e, "dead-letter publish failed");
                PipelineError::DlqWrite(e.to_string())
            })
    }
}

/// One page of dead letters.
#[derive(Debug)]
pub struct DlqPage {
    /// `(stream sequence, decoded letter)` pairs in stream order.
    pub letters: Vec<(u64, DeadLetter)>,

    /// Cursor for the next page; `None` when the stream is exhausted.
    pub next: Option<u64>,
}

/// Pages through a pipeline's dead letters.
pub struct DlqReader {
    bus: BusClient,
    stream: String,
}

impl DlqReader {
    pub fn new(bus: BusClient, pipeline_id: &str) -> Self {
        Self {
            bus,
            stream: topology::dlq_stream(pipeline_id),
        }
    }

    /// Read up to `page_size` letters starting at `start_sequence`
    /// (1-based, inclusive).
    ///
    /// Uses an ephemeral unacknowledged consumer so paging never disturbs
    /// the durable consumers of the pipeline.
    pub async fn page(&self, start_sequence: u64, page_size: usize) -> Result<DlqPage> {
        let stream = self
            .bus
            .jetstream()
            .get_stream(&self.stream)
            .await
            .map_err(|e| PipelineError::StreamUnavailable {
                stream: self.stream.clone(),
                message: format!("failed to get stream: {e}"),
            })?;

        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: None,
                deliver_policy: DeliverPolicy::ByStartSequence {
                    start_sequence: start_sequence.max(1),
                },
                ack_policy: AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| PipelineError::StreamUnavailable {
                stream: self.stream.clone(),
                message: format!("failed to create ephemeral consumer: {e}"),
            })?;

        let messages = consumer
            .fetch()
            .max_messages(page_size)
            .expires(std::time::Duration::from_secs(5))
            .messages()
            .await
            .map_err(|e| PipelineError::StreamUnavailable {
                stream: self.stream.clone(),
                message: format!("fetch failed: {e}"),
            })?;

        let collected: Vec<_> = messages.collect().await;

        let mut letters = Vec::with_capacity(collected.len());
        for item in collected {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "skipping unreadable dead letter");
                    continue;
                }
            };
            let sequence = message.info().map(|i| i.stream_sequence).unwrap_or(0);
            match serde_json::from_slice::<DeadLetter>(&message.payload) {
                Ok(letter) => letters.push((sequence, letter)),
                Err(e) => {
                    warn!(stream = %self.stream, sequence, error = %e, "undecodable dead letter");
                }
            }
        }

        let next = if letters.len() < page_size {
            None
        } else {
            letters.last().map(|(sequence, _)| sequence + 1)
        };

        Ok(DlqPage { letters, next })
    }
}
