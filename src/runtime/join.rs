//! Join role: two input streams, one joined output stream.
//!
//! One reader task per side pulls batches, extracts the join key and pushes
//! records into the shared [`TemporalJoiner`]; a single writer task
//! publishes the emissions and acks each side's batch barrier after its
//! emissions are durable. Buffer mutations serialize on the joiner's
//! internal lock, so the two readers never interleave them.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Batch, BatchReader, BatchWriter, BusClient, OutboundMessage};
use crate::dlq::DlqWriter;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{topology, DeadLetter, JoinOrientation, PipelineSpec, SourceRecord};
use crate::pipeline::TemporalJoiner;
use crate::runtime::{RunState, WorkerConfig};

const PULL_BATCH: usize = 256;
const PULL_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

struct WorkItem {
    outbound: Vec<OutboundMessage>,
    batch: Batch,
}

/// How often the background sweeper bounds the join buffers.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// The join role's worker: two side readers around one buffer pair.
pub struct JoinRunner {
    joiner: Arc<TemporalJoiner>,
    left: SideReader,
    right: SideReader,
    writer: BatchWriter,
}

impl JoinRunner {
    pub async fn new(_config: &WorkerConfig, spec: &PipelineSpec, bus: BusClient) -> Result<Self> {
        let join = spec
            .join
            .as_ref()
            .filter(|j| j.enabled)
            .ok_or_else(|| PipelineError::ConfigInvalid("join role without join config".to_string()))?;

        let joiner = Arc::new(TemporalJoiner::from_spec(join)?);
        let dlq = Arc::new(DlqWriter::new(bus.clone(), &spec.id));
        let out_stream = join.output_stream_id.clone();

        let left = Self::side(&bus, spec, join, JoinOrientation::Left, &joiner, &dlq, &out_stream)
            .await?;
        let right =
            Self::side(&bus, spec, join, JoinOrientation::Right, &joiner, &dlq, &out_stream)
                .await?;

        Ok(Self {
            joiner,
            left,
            right,
            writer: BatchWriter::new(bus),
        })
    }

    async fn side(
        bus: &BusClient,
        spec: &PipelineSpec,
        join: &crate::models::JoinSpec,
        orientation: JoinOrientation,
        joiner: &Arc<TemporalJoiner>,
        dlq: &Arc<DlqWriter>,
        out_stream: &str,
    ) -> Result<SideReader> {
        let source = join.source(orientation).ok_or_else(|| {
            PipelineError::ConfigInvalid(format!("join is missing its {orientation} source"))
        })?;
        let consumer =
            topology::consumer_name(&spec.id, "join", Some(orientation.as_str()), None);
        let reader = bus
            .batch_reader(
                &source.stream_id,
                &consumer,
                &topology::wildcard(&source.stream_id),
            )
            .await?;

        Ok(SideReader {
            pipeline_id: spec.id.clone(),
            side: orientation,
            stream: source.stream_id.clone(),
            out_stream: out_stream.to_string(),
            reader,
            joiner: joiner.clone(),
            dlq: dlq.clone(),
        })
    }

    pub async fn run(
        self,
        cancel: CancellationToken,
        control: watch::Receiver<RunState>,
    ) -> Result<()> {
        info!(left = %self.left.stream, right = %self.right.stream, "join worker started");

        let (tx, rx) = mpsc::channel::<WorkItem>(4);

        let sweeper = self.joiner.spawn_sweeper(SWEEP_INTERVAL, cancel.clone());
        let writer = self.writer.clone();
        let writer_handle = tokio::spawn(async move { write_loop(writer, rx).await });

        let left = self.left;
        let right = self.right;
        let (left_tx, right_tx) = (tx.clone(), tx);
        let (left_cancel, right_cancel) = (cancel.clone(), cancel);
        let (left_control, right_control) = (control.clone(), control);

        let left_handle =
            tokio::spawn(async move { left.run(left_tx, left_cancel, left_control).await });
        let right_handle =
            tokio::spawn(async move { right.run(right_tx, right_cancel, right_control).await });

        let left_result = left_handle
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("left reader panicked: {e}")))?;
        let right_result = right_handle
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("right reader panicked: {e}")))?;

        // Both readers are done and their senders dropped; the writer
        // drains what is queued and exits.
        let write_result = writer_handle
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("writer task panicked: {e}")))?;

        sweeper.abort();
        let stats = self.joiner.stats();
        info!(
            emitted = stats.emitted,
            buffered_left = stats.buffered_left,
            buffered_right = stats.buffered_right,
            "join worker drained"
        );
        left_result.and(right_result).and(write_result)
    }
}

/// One side's reader loop.
struct SideReader {
    pipeline_id: String,
    side: JoinOrientation,
    stream: String,
    out_stream: String,
    reader: BatchReader,
    joiner: Arc<TemporalJoiner>,
    dlq: Arc<DlqWriter>,
}

impl SideReader {
    async fn run(
        self,
        tx: mpsc::Sender<WorkItem>,
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

            let batch = match self.reader.pull(PULL_BATCH, PULL_WAIT).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(side = %self.side, error = %e, "pull failed, backing off");
                    tokio::time::sleep(crate::retry::BASE_DELAY).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                self.joiner.purge_expired();
                continue;
            }

            let outbound = self.process_batch(&batch).await?;
            if tx.send(WorkItem { outbound, batch }).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn process_batch(&self, batch: &Batch) -> Result<Vec<OutboundMessage>> {
        let mut outbound = Vec::new();

        for message in batch.messages() {
            let payload = message.payload();

            let envelope = match serde_json::from_slice::<SourceRecord>(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.dead_letter(payload, format!("undecodable envelope: {e}")).await?;
                    continue;
                }
            };

            let key = match self.joiner.key_path(self.side).key_bytes(&envelope.payload) {
                Ok(key) => key,
                Err(e) => {
                    self.dead_letter(payload, e.to_string()).await?;
                    continue;
                }
            };

            let emission = self.joiner.push(
                self.side,
                key,
                envelope.payload,
                envelope.ingested_at,
                message.stream_sequence(),
            );

            if let Some(emission) = emission {
                let publish_id = format!("{}.{}", self.pipeline_id, emission.publish_id());
                let out = SourceRecord::new(
                    "join",
                    0,
                    emission.right_sequence as i64,
                    emission.record,
                );
                let bytes = serde_json::to_vec(&out).map_err(|e| {
                    PipelineError::ConfigInvalid(format!("encode envelope: {e}"))
                })?;
                outbound.push(
                    OutboundMessage::new(topology::subject(&self.out_stream, 0), bytes)
                        .with_publish_id(publish_id),
                );
            }
        }

        Ok(outbound)
    }

    async fn dead_letter(&self, original: &[u8], message: String) -> Result<()> {
        let letter = DeadLetter::new(
            &self.pipeline_id,
            "join",
            ErrorKind::PoisonRecord,
            message,
            original,
            &self.stream,
        );
        self.dlq.write(&letter).await
    }
}

async fn write_loop(writer: BatchWriter, mut rx: mpsc::Receiver<WorkItem>) -> Result<()> {
    while let Some(item) = rx.recv().await {
        match writer.publish_all(&item.outbound).await {
            Ok(()) => item.batch.ack().await?,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "joined publish failed, requesting redelivery");
                item.batch.nak().await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
