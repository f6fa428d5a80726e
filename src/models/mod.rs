//! Data model for pipeline specifications, status, records and topology.

pub mod pipeline;
pub mod record;
pub mod status;
pub mod topology;

pub use pipeline::{
    BatchSpec, ColumnMapping, DedupSpec, FieldMapping, FilterSpec, JoinOrientation,
    JoinSourceSpec, JoinSpec, JoinType, PipelineSpec, SinkConnection, SinkSpec, SourceSpec,
    StatusBlock, TargetType, TopicSpec, TransformSpec,
};
pub use record::{DeadLetter, DeadLetterError, SourceRecord};
pub use status::{PipelineOperation, PipelineStatus};
