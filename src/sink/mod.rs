//! Columnar sink stage.
//!
//! The batcher pulls from the bus, maps records onto sink columns, writes
//! each batch atomically through the [`ColumnarSink`] trait and only then
//! acknowledges the batch barrier.

pub mod batcher;
pub mod clickhouse;
pub mod mapping;

pub use batcher::{SinkBatcher, SinkBatcherStats};
pub use clickhouse::{ClickHouseSink, ColumnarSink};
pub use mapping::SchemaMapping;
