//! Bus connection and stream/bucket provisioning.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, stream::Config as StreamConfig};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::bus::consumer::BatchReader;
use crate::bus::kv::KvBucket;
use crate::error::{PipelineError, Result};

/// Bus connection settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bus server URL, e.g. `nats://localhost:4222`.
    pub url: String,

    /// Upper bound on unacknowledged deliveries per consumer.
    pub max_ack_pending: i64,

    /// How long the server waits for an ack before redelivering.
    pub ack_wait: Duration,

    /// How long a publish waits for the server ack.
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            max_ack_pending: 1000,
            ack_wait: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide bus handle.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct BusClient {
    jetstream: jetstream::Context,
    config: BusConfig,
}

impl BusClient {
    /// Connect to the bus.
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: BusConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            PipelineError::StreamUnavailable {
                stream: "<connection>".to_string(),
                message: format!("failed to connect to bus: {e}"),
            }
        })?;

        info!(url = %config.url, "connected to stream bus");

        Ok(Self {
            jetstream: jetstream::new(client),
            config,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create the stream if it is missing, otherwise reconcile its config.
    ///
    /// A reconcile rejected by the server is a config conflict and fatal for
    /// that stream; everything else is treated as the bus being unavailable.
    #[instrument(skip(self, subjects))]
    pub async fn ensure_stream(
        &self,
        name: &str,
        subjects: Vec<String>,
        max_age: Duration,
    ) -> Result<()> {
        let config = StreamConfig {
            name: name.to_string(),
            subjects,
            max_age,
            ..Default::default()
        };

        match self.jetstream.get_stream(name).await {
            Ok(_) => {
                debug!(stream = %name, "stream exists, reconciling config");
                self.jetstream
                    .update_stream(config)
                    .await
                    .map_err(|e| PipelineError::StreamConfigConflict {
                        stream: name.to_string(),
                        message: e.to_string(),
                    })?;
            }
            Err(_) => {
                info!(stream = %name, "creating stream");
                self.jetstream.create_stream(config).await.map_err(|e| {
                    PipelineError::StreamUnavailable {
                        stream: name.to_string(),
                        message: format!("failed to create stream: {e}"),
                    }
                })?;
            }
        }

        Ok(())
    }

    /// Open the named KV bucket, creating it if absent.
    pub async fn ensure_kv(&self, bucket: &str) -> Result<KvBucket> {
        let store = match self.jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(jetstream::kv::Config {
                    bucket: bucket.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|e| PipelineError::Kv(format!("failed to create bucket `{bucket}`: {e}")))?,
        };
        Ok(KvBucket::new(store))
    }

    /// Publish one payload and wait for the server ack.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.publish_with_id(subject, payload, None).await
    }

    /// Publish with an optional idempotency id (`Nats-Msg-Id`).
    ///
    /// Publishes carrying the same id within the stream's duplicate window
    /// are deduplicated by the server, which is what makes retries after a
    /// partial batch publish safe.
    pub async fn publish_with_id(
        &self,
        subject: &str,
        payload: Bytes,
        publish_id: Option<&str>,
    ) -> Result<()> {
        let ack_future = match publish_id {
            Some(id) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert("Nats-Msg-Id", id);
                self.jetstream
                    .publish_with_headers(subject.to_string(), headers, payload)
                    .await
            }
            None => self.jetstream.publish(subject.to_string(), payload).await,
        }
        .map_err(|e| PipelineError::StreamUnavailable {
            stream: subject.to_string(),
            message: format!("publish failed: {e}"),
        })?;

        let ack = tokio::time::timeout(self.config.publish_timeout, ack_future)
            .await
            .map_err(|_| PipelineError::Timeout {
                what: format!("publish ack on {subject}"),
                after: self.config.publish_timeout,
            })?;

        ack.map_err(|e| PipelineError::StreamUnavailable {
            stream: subject.to_string(),
            message: format!("publish ack failed: {e}"),
        })?;

        Ok(())
    }

    /// Open a durable pull consumer on a stream.
    ///
    /// `filter_subject` selects a wildcard slice of the stream; pass the
    /// stream wildcard to read everything.
    pub async fn batch_reader(
        &self,
        stream: &str,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<BatchReader> {
        let js_stream =
            self.jetstream
                .get_stream(stream)
                .await
                .map_err(|e| PipelineError::StreamUnavailable {
                    stream: stream.to_string(),
                    message: format!("failed to get stream: {e}"),
                })?;

        let consumer = js_stream
            .get_or_create_consumer(
                consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: filter_subject.to_string(),
                    max_ack_pending: self.config.max_ack_pending,
                    ack_wait: self.config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| PipelineError::StreamUnavailable {
                stream: stream.to_string(),
                message: format!("failed to create consumer `{consumer_name}`: {e}"),
            })?;

        debug!(stream = %stream, consumer = %consumer_name, filter = %filter_subject, "consumer ready");

        Ok(BatchReader::new(stream.to_string(), consumer))
    }

    /// Raw JetStream context for components with bespoke needs (DLQ paging).
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }
}
