//! Batch assembly and the publish-then-ack barrier at the sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Batch, BatchReader};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{BatchSpec, DeadLetter, SourceRecord};
use crate::pipeline::chain::DeadLetterSink;
use crate::retry::{Backoff, FAILURE_DEADLINE};
use crate::runtime::RunState;
use crate::sink::clickhouse::ColumnarSink;
use crate::sink::mapping::SchemaMapping;

/// Counters kept by the batcher; snapshot via [`SinkBatcher::stats`].
#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    records_written: AtomicU64,
    dead_letters: AtomicU64,
    insert_retries: AtomicU64,
}

/// Snapshot of the batcher's counters.
#[derive(Debug, Clone, Default)]
pub struct SinkBatcherStats {
    pub batches: u64,
    pub records_written: u64,
    pub dead_letters: u64,
    pub insert_retries: u64,
}

/// Pulls batches, maps them onto sink columns, writes them atomically and
/// acks the barrier only after the write succeeded.
pub struct SinkBatcher {
    pipeline_id: String,
    reader: BatchReader,
    mapping: SchemaMapping,
    sink: Arc<dyn ColumnarSink>,
    dlq: Arc<dyn DeadLetterSink>,
    batch: BatchSpec,
    counters: Counters,
}

impl SinkBatcher {
    pub fn new(
        pipeline_id: impl Into<String>,
        reader: BatchReader,
        mapping: SchemaMapping,
        sink: Arc<dyn ColumnarSink>,
        dlq: Arc<dyn DeadLetterSink>,
        batch: BatchSpec,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            reader,
            mapping,
            sink,
            dlq,
            batch,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> SinkBatcherStats {
        SinkBatcherStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            records_written: self.counters.records_written.load(Ordering::Relaxed),
            dead_letters: self.counters.dead_letters.load(Ordering::Relaxed),
            insert_retries: self.counters.insert_retries.load(Ordering::Relaxed),
        }
    }

    /// Main loop. Returns when cancelled (after draining the in-flight
    /// batch) or on a fatal error.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut control: watch::Receiver<RunState>,
    ) -> Result<()> {
        info!(pipeline = %self.pipeline_id, stream = %self.reader.stream(), "sink batcher started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Paused: stop pulling, keep the consumer and everything in
            // flight alive, wait for resume or shutdown.
            if *control.borrow() == RunState::Paused {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let batch = match self.reader.pull(self.batch.max_size, self.batch.max_delay()).await {
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

            // The in-flight batch is always completed, even when shutdown
            // was requested while pulling: drain means write-then-ack, not
            // abandon. The one exception is cancellation during the retry
            // loop, where the batch has been nak'd for redelivery.
            match self.process_batch(batch, &cancel).await {
                Ok(()) => {}
                Err(PipelineError::Shutdown) => break,
                Err(e) => return Err(e),
            }
        }

        info!(pipeline = %self.pipeline_id, "sink batcher drained");
        Ok(())
    }

    async fn process_batch(&self, batch: Batch, cancel: &CancellationToken) -> Result<()> {
        let mut rows = Vec::with_capacity(batch.len());

        for message in batch.messages() {
            let payload = message.payload();
            let record = match serde_json::from_slice::<SourceRecord>(payload) {
                Ok(envelope) => envelope.payload,
                Err(e) => {
                    self.dead_letter(payload, format!("undecodable envelope: {e}")).await?;
                    continue;
                }
            };

            match self.mapping.map_record(&record) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    // One bad record never holds the batch hostage.
                    self.dead_letter(payload, e.to_string()).await?;
                }
            }
        }

        if let Err(e) = self.insert_with_retry(&rows, cancel).await {
            warn!(error = %e, "batch insert failed, requesting redelivery");
            batch.nak().await?;
            return match e.kind() {
                ErrorKind::Transient => Ok(()),
                _ => Err(e),
            };
        }

        let written = rows.len() as u64;
        batch.ack().await?;

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.records_written.fetch_add(written, Ordering::Relaxed);
        debug!(rows = written, "batch written and acked");
        Ok(())
    }

    async fn insert_with_retry(
        &self,
        rows: &[serde_json::Map<String, serde_json::Value>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut backoff = Backoff::default();
        let started = Instant::now();

        loop {
            match self.sink.insert(rows).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if started.elapsed() >= FAILURE_DEADLINE {
                        error!(error = %e, "sink failing continuously, elevating to fatal");
                        return Err(PipelineError::RetriesExhausted {
                            elapsed: started.elapsed(),
                            source: Box::new(e),
                        });
                    }

                    let delay = backoff.next_delay();
                    self.counters.insert_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "sink insert failed, retrying");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(PipelineError::Shutdown),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter(&self, original: &[u8], message: String) -> Result<()> {
        let letter = DeadLetter::new(
            &self.pipeline_id,
            "sink",
            ErrorKind::PoisonRecord,
            message,
            original,
            self.reader.stream(),
        );
        self.dlq.write(&letter).await?;
        self.counters.dead_letters.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
