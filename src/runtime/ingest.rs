//! Ingestor role: Kafka topic -> input stream bridge.
//!
//! A reader task consumes the source topic; a writer task publishes each
//! record to the pipeline's input stream and commits the Kafka offset only
//! after the bus ack, so a crash between the two replays rather than loses.
//! When deduplication is enabled and the topic runs more than one replica,
//! subjects are sharded by the dedup key so every observation of a key lands
//! on the same downstream consumer.

use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::bus::BusClient;
use crate::dlq::DlqWriter;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{topology, DeadLetter, PipelineSpec, SourceRecord};
use crate::pipeline::path::JsonPath;
use crate::retry::Backoff;
use crate::runtime::{RunState, WorkerConfig};

/// One record handed from the reader to the writer task.
struct PendingRecord {
    envelope: SourceRecord,
    shard: u32,
}

/// Kafka -> bus bridge for one source topic.
pub struct KafkaIngestor {
    consumer: Arc<StreamConsumer>,
    bus: BusClient,
    pipeline_id: String,
    topic: String,
    stream: String,
    shard_count: u32,
    dedup_key: Option<JsonPath>,
    dlq: DlqWriter,
}

impl KafkaIngestor {
    pub async fn new(config: &WorkerConfig, spec: &PipelineSpec, bus: BusClient) -> Result<Self> {
        let topic_name = config.topic.clone().ok_or_else(|| {
            PipelineError::ConfigInvalid("ingestor requires TOPIC".to_string())
        })?;
        let topic = spec.topic(&topic_name).ok_or_else(|| {
            PipelineError::ConfigInvalid(format!("topic `{topic_name}` not in pipeline spec"))
        })?;

        let group_id = topology::consumer_name(&spec.id, "ingestor", Some(&topic_name), None);

        // Offsets advance only on our explicit commits after bus acks.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &group_id)
            .set("bootstrap.servers", config.kafka_brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("heartbeat.interval.ms", "2000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("fetch.wait.max.ms", "500")
            .create()
            .map_err(|e| PipelineError::ConfigInvalid(format!("kafka consumer: {e}")))?;

        consumer
            .subscribe(&[topic_name.as_str()])
            .map_err(|e| PipelineError::ConfigInvalid(format!("subscribe {topic_name}: {e}")))?;

        info!(topic = %topic_name, group = %group_id, "subscribed to source topic");

        let dedup_key = match topic.dedup() {
            Some(dedup) => Some(JsonPath::compile(&dedup.key_path)?),
            None => None,
        };

        let dlq = DlqWriter::new(bus.clone(), &spec.id);

        Ok(Self {
            consumer: Arc::new(consumer),
            bus,
            pipeline_id: spec.id.clone(),
            topic: topic_name.clone(),
            stream: topology::input_stream(&spec.id, &topic_name),
            shard_count: topic.replicas.max(1),
            dedup_key,
            dlq,
        })
    }

    /// Run reader and writer to completion.
    pub async fn run(
        self,
        cancel: CancellationToken,
        control: watch::Receiver<RunState>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<PendingRecord>(1024);

        let writer = WriterTask {
            bus: self.bus.clone(),
            consumer: self.consumer.clone(),
            stream: self.stream.clone(),
            topic: self.topic.clone(),
        };
        let writer_cancel = cancel.clone();
        let writer_handle = tokio::spawn(async move { writer.run(rx, writer_cancel).await });

        let read_result = self.read_loop(tx, cancel.clone(), control).await;

        // The channel is closed by now; the writer drains what is in flight
        // and exits.
        let write_result = writer_handle
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("writer task panicked: {e}")))?;

        read_result.and(write_result)
    }

    async fn read_loop(
        &self,
        tx: mpsc::Sender<PendingRecord>,
        cancel: CancellationToken,
        mut control: watch::Receiver<RunState>,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if *control.borrow() == RunState::Paused {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.consumer.recv() => received,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "kafka receive failed");
                    tokio::time::sleep(crate::retry::BASE_DELAY).await;
                    continue;
                }
            };

            let Some(payload) = message.payload() else {
                debug!(topic = %self.topic, "skipping empty record");
                continue;
            };

            let record = match serde_json::from_slice::<serde_json::Value>(payload) {
                Ok(record) => record,
                Err(e) => {
                    self.dead_letter(payload, format!("record is not JSON: {e}")).await?;
                    continue;
                }
            };

            let shard = match self.shard_for(&record, message.partition()) {
                Ok(shard) => shard,
                Err(e) if e.kind() == ErrorKind::PoisonRecord => {
                    self.dead_letter(payload, e.to_string()).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let envelope =
                SourceRecord::new(&self.topic, message.partition(), message.offset(), record);

            if tx.send(PendingRecord { envelope, shard }).await.is_err() {
                // Writer is gone; its own result carries the reason.
                return Ok(());
            }
        }
    }

    /// Subject shard for a record: dedup key hash when key routing is
    /// required, source partition otherwise.
    fn shard_for(&self, record: &serde_json::Value, partition: i32) -> Result<u32> {
        match &self.dedup_key {
            Some(path) if self.shard_count > 1 => {
                let key = path.key_bytes(record)?;
                Ok((xxh3_64(&key) % self.shard_count as u64) as u32)
            }
            _ => Ok(partition.unsigned_abs() % self.shard_count),
        }
    }

    async fn dead_letter(&self, original: &[u8], message: String) -> Result<()> {
        let letter = DeadLetter::new(
            &self.pipeline_id,
            "ingestor",
            ErrorKind::PoisonRecord,
            message,
            original,
            &self.stream,
        );
        self.dlq.write(&letter).await
    }
}

/// Publishes pending records and commits their Kafka offsets.
struct WriterTask {
    bus: BusClient,
    consumer: Arc<StreamConsumer>,
    stream: String,
    topic: String,
}

impl WriterTask {
    async fn run(
        &self,
        mut rx: mpsc::Receiver<PendingRecord>,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Drain everything the reader queued, even after cancellation: each
        // popped record is published and committed before exit. The one
        // exception is cancellation during the publish retry loop, where
        // the uncommitted offsets simply replay on restart.
        while let Some(pending) = rx.recv().await {
            match self.publish_and_commit(pending, &cancel).await {
                Ok(()) => {}
                Err(PipelineError::Shutdown) => break,
                Err(e) => return Err(e),
            }
        }
        info!(topic = %self.topic, "ingest writer drained");
        Ok(())
    }

    async fn publish_and_commit(
        &self,
        pending: PendingRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let subject = topology::subject(&self.stream, pending.shard);
        let publish_id = pending.envelope.publish_id();
        let payload = serde_json::to_vec(&pending.envelope)
            .map_err(|e| PipelineError::ConfigInvalid(format!("encode envelope: {e}")))?;

        let mut backoff = Backoff::default();
        loop {
            match self
                .bus
                .publish_with_id(&subject, payload.clone().into(), Some(&publish_id))
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(subject = %subject, error = %e, delay_ms = delay.as_millis() as u64, "publish failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        // On shutdown the uncommitted offset replays; the
                        // publish id keeps the replay idempotent.
                        _ = cancel.cancelled() => return Err(PipelineError::Shutdown),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &self.topic,
                pending.envelope.partition,
                Offset::Offset(pending.envelope.offset + 1),
            )
            .map_err(|e| PipelineError::Orchestrator(format!("offset list: {e}")))?;

        if let Err(e) = self.consumer.commit(&offsets, CommitMode::Async) {
            // Commit failures replay records; publish ids collapse them.
            error!(topic = %self.topic, error = %e, "offset commit failed");
        }

        Ok(())
    }
}
