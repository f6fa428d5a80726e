//! Error taxonomy for the ETL core.
//!
//! Every failure maps onto exactly one [`ErrorKind`], which is what callers
//! branch on: retry locally, dead-letter the record, reject the operation,
//! or stop and wait for an operator. Components return the concrete
//! [`PipelineError`] variants; only the role loops look at the kind.

use std::time::Duration;

use thiserror::Error;

/// Coarse error classification driving retry/DLQ/escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry locally with bounded exponential backoff (bus blips, sink timeouts).
    Transient,
    /// Dead-letter the record and continue with the rest of the stream.
    PoisonRecord,
    /// Fatal at startup; the worker must not enter the running state.
    ConfigInvalid,
    /// The requested lifecycle operation is not legal from the current state.
    InvalidStateTransition,
    /// The pipeline id is unknown to the catalog or orchestrator.
    PipelineNotFound,
    /// Stop pulling, move the pipeline to `Failed`, await operator action.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::PoisonRecord => "poison_record",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::PipelineNotFound => "pipeline_not_found",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// What went wrong while applying a field mapping or extracting a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorKind {
    /// The source path does not exist in the record.
    MissingPath,
    /// The value at the source path cannot be coerced to the declared type.
    TypeMismatch,
}

impl std::fmt::Display for TransformErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformErrorKind::MissingPath => f.write_str("missing path"),
            TransformErrorKind::TypeMismatch => f.write_str("type mismatch"),
        }
    }
}

/// Unified error type for the pipeline core.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream {stream} unavailable: {message}")]
    StreamUnavailable { stream: String, message: String },

    #[error("stream {stream} configuration conflict: {message}")]
    StreamConfigConflict { stream: String, message: String },

    #[error("partial publish: {published} of {total} messages made it to the bus")]
    PartialPublish { published: usize, total: usize },

    #[error("bus key-value error: {0}")]
    Kv(String),

    #[error("transform failed at `{path}`: {kind}")]
    Transform {
        path: String,
        kind: TransformErrorKind,
    },

    #[error("filter evaluation failed: {0}")]
    FilterEval(String),

    #[error("dedup backend error: {0}")]
    DedupBackend(String),

    #[error("schema mapping failed for column `{column}`: {message}")]
    SchemaMapping { column: String, message: String },

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("dead-letter publish failed: {0}")]
    DlqWrite(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid state transition: {from} -> {requested}")]
    InvalidStateTransition { from: String, requested: String },

    #[error("pipeline `{0}` not found")]
    PipelineNotFound(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("retries exhausted after {elapsed:?}: {source}")]
    RetriesExhausted {
        elapsed: Duration,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("worker is shutting down")]
    Shutdown,
}

impl PipelineError {
    /// The classification callers branch on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::StreamUnavailable { .. }
            | PipelineError::PartialPublish { .. }
            | PipelineError::Kv(_)
            | PipelineError::SinkWrite(_)
            | PipelineError::Timeout { .. } => ErrorKind::Transient,

            PipelineError::Transform { .. }
            | PipelineError::FilterEval(_)
            | PipelineError::DedupBackend(_)
            | PipelineError::SchemaMapping { .. } => ErrorKind::PoisonRecord,

            PipelineError::StreamConfigConflict { .. } | PipelineError::ConfigInvalid(_) => {
                ErrorKind::ConfigInvalid
            }

            PipelineError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,

            PipelineError::PipelineNotFound(_) => ErrorKind::PipelineNotFound,

            PipelineError::Orchestrator(_)
            | PipelineError::DlqWrite(_)
            | PipelineError::RetriesExhausted { .. }
            | PipelineError::Shutdown => ErrorKind::Fatal,
        }
    }

    /// Shorthand used by the role loops.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = PipelineError::StreamUnavailable {
            stream: "p1.in.t1".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_transient());

        let err = PipelineError::Transform {
            path: "payload.amount".to_string(),
            kind: TransformErrorKind::TypeMismatch,
        };
        assert_eq!(err.kind(), ErrorKind::PoisonRecord);

        let err = PipelineError::DlqWrite("publish ack timed out".to_string());
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_retries_exhausted_wraps_source() {
        let inner = PipelineError::SinkWrite("insert rejected".to_string());
        let err = PipelineError::RetriesExhausted {
            elapsed: Duration::from_secs(300),
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("retries exhausted"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PoisonRecord).unwrap();
        assert_eq!(json, "\"poison_record\"");
        assert_eq!(ErrorKind::PoisonRecord.to_string(), "poison_record");
    }
}
