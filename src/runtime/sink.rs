//! Sink role wiring.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusClient;
use crate::dlq::DlqWriter;
use crate::error::Result;
use crate::models::{topology, PipelineSpec};
use crate::runtime::WorkerConfig;
use crate::sink::{ClickHouseSink, SchemaMapping, SinkBatcher};

/// Per-operation timeout for one sink insert.
const INSERT_TIMEOUT: Duration = Duration::from_secs(60);

/// Assemble the sink batcher for a pipeline.
pub async fn build_sink(
    _config: &WorkerConfig,
    spec: &PipelineSpec,
    bus: BusClient,
) -> Result<SinkBatcher> {
    let stream = &spec.sink.stream_id;
    let consumer = topology::consumer_name(&spec.id, "sink", None, None);
    let reader = bus
        .batch_reader(stream, &consumer, &topology::wildcard(stream))
        .await?;

    let mapping = SchemaMapping::compile(&spec.sink.column_mapping)?;
    let columns = mapping.column_names();
    let sink = Arc::new(ClickHouseSink::new(
        &spec.sink.connection,
        &columns,
        INSERT_TIMEOUT,
    )?);
    let dlq = Arc::new(DlqWriter::new(bus.clone(), &spec.id));

    Ok(SinkBatcher::new(
        spec.id.clone(),
        reader,
        mapping,
        sink,
        dlq,
        spec.sink.batch.clone(),
    ))
}
