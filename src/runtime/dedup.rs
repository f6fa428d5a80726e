//! Dedup role: filter/dedup/transform between input and dedup streams.
//!
//! The reader task pulls batches from the input stream and runs each record
//! through the processor chain; the writer task publishes the surviving
//! records to the dedup output stream and acks the batch barrier only after
//! every publish ack. Records keep their inbound subject shard so key
//! routing established by the ingestor survives the hop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Batch, BatchReader, BatchWriter, OutboundMessage};
use crate::dedup::DedupStore;
use crate::dlq::DlqWriter;
use crate::error::{PipelineError, Result};
use crate::models::{topology, PipelineSpec, SourceRecord};
use crate::pipeline::{ChainOutput, ProcessorChain};
use crate::runtime::{RunState, WorkerConfig};

/// Records pulled per batch and the pull timeout.
const PULL_BATCH: usize = 256;
const PULL_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

/// One processed batch handed to the writer.
struct WorkItem {
    outbound: Vec<OutboundMessage>,
    batch: Batch,
}

/// The dedup role's worker.
pub struct DedupRunner {
    pipeline_id: String,
    reader: BatchReader,
    writer: BatchWriter,
    chain: ProcessorChain,
    dlq: Arc<DlqWriter>,
    in_stream: String,
    out_stream: String,
}

impl DedupRunner {
    pub async fn new(
        config: &WorkerConfig,
        spec: &PipelineSpec,
        bus: crate::bus::BusClient,
        store: Arc<dyn DedupStore>,
    ) -> Result<Self> {
        let topic_name = config.topic.clone().ok_or_else(|| {
            PipelineError::ConfigInvalid("dedup role requires TOPIC".to_string())
        })?;
        let topic = spec
            .topic(&topic_name)
            .ok_or_else(|| {
                PipelineError::ConfigInvalid(format!("topic `{topic_name}` not in pipeline spec"))
            })?
            .clone();

        let in_stream = topology::input_stream(&spec.id, &topic_name);
        let out_stream = topic.output_stream_id.clone();

        // A replica pinned to a shard consumes only its slice of the
        // stream; unpinned workers read the whole wildcard.
        let filter_subject = match config.shard {
            Some(shard) => topology::subject(&in_stream, shard),
            None => topology::wildcard(&in_stream),
        };
        let consumer = topology::consumer_name(&spec.id, "dedup", Some(&topic_name), config.shard);

        let reader = bus.batch_reader(&in_stream, &consumer, &filter_subject).await?;
        let dlq = Arc::new(DlqWriter::new(bus.clone(), &spec.id));
        let chain =
            ProcessorChain::for_dedup_role(spec, &topic, in_stream.clone(), store, dlq.clone())?;

        Ok(Self {
            pipeline_id: spec.id.clone(),
            reader,
            writer: BatchWriter::new(bus),
            chain,
            dlq,
            in_stream,
            out_stream,
        })
    }

    pub async fn run(
        self,
        cancel: CancellationToken,
        mut control: watch::Receiver<RunState>,
    ) -> Result<()> {
        info!(stream = %self.in_stream, "dedup worker started");

        let (tx, rx) = mpsc::channel::<WorkItem>(4);

        let writer = self.writer.clone();
        let writer_handle = tokio::spawn(async move { write_loop(writer, rx).await });

        let read_result = self.read_loop(tx, cancel, &mut control).await;
        let write_result = writer_handle
            .await
            .map_err(|e| PipelineError::Orchestrator(format!("writer task panicked: {e}")))?;

        info!(stream = %self.in_stream, "dedup worker drained");
        read_result.and(write_result)
    }

    async fn read_loop(
        &self,
        tx: mpsc::Sender<WorkItem>,
        cancel: CancellationToken,
        control: &mut watch::Receiver<RunState>,
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
                    warn!(error = %e, "pull failed, backing off");
                    tokio::time::sleep(crate::retry::BASE_DELAY).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                continue;
            }

            match self.process_batch(&batch).await {
                Ok(outbound) => {
                    if tx.send(WorkItem { outbound, batch }).await.is_err() {
                        return Ok(());
                    }
                }
                // Dedup backend errors have already dead-lettered the
                // record; the batch is redelivered so the observation is
                // not lost with the offset.
                Err(e)
                    if e.is_transient() || matches!(e, PipelineError::DedupBackend(_)) =>
                {
                    warn!(error = %e, "batch processing failed, requesting redelivery");
                    batch.nak().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every record of the batch through the chain, collecting the
    /// outbound publishes. Poisoned records are dead-lettered inside the
    /// chain; a transient failure aborts the batch for redelivery.
    async fn process_batch(&self, batch: &Batch) -> Result<Vec<OutboundMessage>> {
        let mut outbound = Vec::with_capacity(batch.len());

        for message in batch.messages() {
            let payload = message.payload();

            let envelope = match serde_json::from_slice::<SourceRecord>(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let letter = crate::models::DeadLetter::new(
                        &self.pipeline_id,
                        "dedup",
                        crate::error::ErrorKind::PoisonRecord,
                        format!("undecodable envelope: {e}"),
                        payload,
                        &self.in_stream,
                    );
                    self.dlq.write(&letter).await?;
                    continue;
                }
            };

            let record = envelope.payload.clone();
            match self.chain.run(payload, record).await? {
                ChainOutput::Emit(processed) => {
                    let out = SourceRecord {
                        payload: processed,
                        ..envelope
                    };
                    let shard = subject_shard(message.subject());
                    let subject = topology::subject(&self.out_stream, shard);
                    let publish_id =
                        format!("{}:{}", self.in_stream, message.stream_sequence());
                    let bytes = serde_json::to_vec(&out).map_err(|e| {
                        PipelineError::ConfigInvalid(format!("encode envelope: {e}"))
                    })?;
                    outbound
                        .push(OutboundMessage::new(subject, bytes).with_publish_id(publish_id));
                }
                ChainOutput::Drop | ChainOutput::DeadLettered => {}
            }
        }

        Ok(outbound)
    }
}

/// Publish each processed batch, then ack its barrier. A publish failure
/// naks the batch; redelivered records republish under the same publish
/// ids and collapse on the bus.
async fn write_loop(writer: BatchWriter, mut rx: mpsc::Receiver<WorkItem>) -> Result<()> {
    while let Some(item) = rx.recv().await {
        match writer.publish_all(&item.outbound).await {
            Ok(()) => item.batch.ack().await?,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "publish failed, requesting redelivery");
                item.batch.nak().await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Shard suffix of a subject (`<stream>.<shard>`).
fn subject_shard(subject: &str) -> u32 {
    subject
        .rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_shard_parsing() {
        assert_eq!(subject_shard("p1.in.t1.3"), 3);
        assert_eq!(subject_shard("p1.in.t1.0"), 0);
        assert_eq!(subject_shard("weird"), 0);
    }
}
