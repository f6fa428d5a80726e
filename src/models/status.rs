//! Pipeline status and lifecycle operation enums.

use serde::{Deserialize, Serialize};

/// Overall lifecycle state of a pipeline.
///
/// The legal transitions between states are enforced by [`crate::lifecycle`];
/// this type only names them and fixes the wire form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Created,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Failed,
}

impl PipelineStatus {
    /// All states, in declaration order. Used by table-driven tests and the
    /// reconciler's exhaustive match.
    pub const ALL: [PipelineStatus; 10] = [
        PipelineStatus::Created,
        PipelineStatus::Running,
        PipelineStatus::Pausing,
        PipelineStatus::Paused,
        PipelineStatus::Resuming,
        PipelineStatus::Stopping,
        PipelineStatus::Stopped,
        PipelineStatus::Terminating,
        PipelineStatus::Terminated,
        PipelineStatus::Failed,
    ];

    /// Whether the state is terminal (no outgoing transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Created => "created",
            PipelineStatus::Running => "running",
            PipelineStatus::Pausing => "pausing",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Resuming => "resuming",
            PipelineStatus::Stopping => "stopping",
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::Terminating => "terminating",
            PipelineStatus::Terminated => "terminated",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation requested against a pipeline by the control plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PipelineOperation {
    Create,
    Start,
    Pause,
    Resume,
    Stop,
    Terminate,
}

impl PipelineOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOperation::Create => "create",
            PipelineOperation::Start => "start",
            PipelineOperation::Pause => "pause",
            PipelineOperation::Resume => "resume",
            PipelineOperation::Stop => "stop",
            PipelineOperation::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for PipelineOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_form_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&PipelineStatus::Terminating).unwrap(),
            "\"terminating\""
        );
        let parsed: PipelineStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(parsed, PipelineStatus::Paused);
    }

    #[test]
    fn test_only_terminated_is_terminal() {
        for status in PipelineStatus::ALL {
            assert_eq!(status.is_terminal(), status == PipelineStatus::Terminated);
        }
    }
}
