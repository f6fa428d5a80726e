//! StreamForge
//!
//! Streaming ETL control plane and data plane: records flow from Kafka
//! source topics through optional filter/dedup/transform stages, an optional
//! two-stream temporal join, and batched inserts into a columnar OLAP store,
//! with a JetStream-style bus carrying every hop and a KV bucket holding the
//! pipeline catalog.
//!
//! # Overview
//!
//! - **Bus adapter** (`bus`): streams, durable pull consumers with explicit
//!   ack, batch publish with ack barriers, KV buckets.
//! - **Processing stages** (`pipeline`): filter expressions, declarative
//!   transforms, dedup, the temporal joiner and the processor chain with
//!   dead-letter routing.
//! - **Dedup backends** (`dedup`): embedded TTL store and a Redis-backed
//!   variant for shared windows.
//! - **Sink** (`sink`): batch assembly, schema mapping and ClickHouse
//!   inserts behind the `ColumnarSink` trait.
//! - **Control plane** (`lifecycle`, `catalog`, `manager`, `orchestrator`):
//!   the status state machine, the persisted catalog, and the local/
//!   Kubernetes orchestrator backends.
//! - **Runtime** (`runtime`): per-role worker loops with pause/resume and
//!   drain-on-signal semantics.
//!
//! # Example
//!
//! ```rust,no_run
//! use streamforge::lifecycle::{validate_operation, OperationOutcome};
//! use streamforge::models::{PipelineOperation, PipelineStatus};
//!
//! // The control plane validates every requested operation against the
//! // lifecycle table before touching the catalog.
//! let outcome = validate_operation(PipelineStatus::Running, PipelineOperation::Pause)?;
//! assert_eq!(outcome, OperationOutcome::Apply(PipelineStatus::Pausing));
//! # Ok::<(), streamforge::error::PipelineError>(())
//! ```

pub mod bus;
pub mod catalog;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod sink;

// Re-export the types most callers need at the crate root.
pub use bus::{BusClient, BusConfig};
pub use catalog::PipelineCatalog;
pub use error::{ErrorKind, PipelineError, Result};
pub use manager::PipelineManager;
pub use models::{PipelineOperation, PipelineSpec, PipelineStatus};
pub use orchestrator::{Orchestrator, PipelineHealth};
pub use runtime::Role;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!VERSION.is_empty());
    }
}
