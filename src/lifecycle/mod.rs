//! Pipeline lifecycle state machine.
//!
//! The transition table is closed: any `(current, next)` pair not listed is
//! rejected with `InvalidStateTransition` and leaves the catalog untouched.
//! Operation requests are idempotent within their target state, so pausing a
//! pipeline that is already `Pausing` (or `Paused`) is a no-op.

use crate::error::{PipelineError, Result};
use crate::models::{PipelineOperation, PipelineStatus};

/// Whether a direct status transition is legal.
pub fn can_transition(from: PipelineStatus, to: PipelineStatus) -> bool {
    use PipelineStatus::*;
    matches!(
        (from, to),
        (Created, Running)
            | (Created, Failed)
            | (Running, Pausing)
            | (Running, Stopping)
            | (Running, Terminating)
            | (Running, Failed)
            | (Pausing, Paused)
            | (Pausing, Failed)
            | (Paused, Resuming)
            | (Paused, Stopping)
            | (Paused, Terminating)
            | (Paused, Failed)
            | (Resuming, Running)
            | (Resuming, Failed)
            | (Stopping, Stopped)
            | (Stopping, Failed)
            | (Stopped, Resuming)
            | (Stopped, Terminating)
            | (Terminating, Terminated)
            | (Terminating, Failed)
            | (Failed, Terminating)
    )
}

/// Validate a direct transition, preserving the current state on rejection.
pub fn validate_transition(from: PipelineStatus, to: PipelineStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(PipelineError::InvalidStateTransition {
            from: from.to_string(),
            requested: to.to_string(),
        })
    }
}

/// How a validated operation request is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Move the pipeline to this state and drive the orchestrator.
    Apply(PipelineStatus),

    /// The pipeline is already in (or moving to) the requested state.
    Noop,
}

/// The transitional state an operation requests.
pub fn requested_state(operation: PipelineOperation) -> PipelineStatus {
    match operation {
        PipelineOperation::Create => PipelineStatus::Created,
        PipelineOperation::Start => PipelineStatus::Running,
        PipelineOperation::Pause => PipelineStatus::Pausing,
        PipelineOperation::Resume => PipelineStatus::Resuming,
        PipelineOperation::Stop => PipelineStatus::Stopping,
        PipelineOperation::Terminate => PipelineStatus::Terminating,
    }
}

/// The settled state an operation eventually reaches.
fn settled_state(operation: PipelineOperation) -> PipelineStatus {
    match operation {
        PipelineOperation::Create => PipelineStatus::Created,
        PipelineOperation::Start => PipelineStatus::Running,
        PipelineOperation::Pause => PipelineStatus::Paused,
        PipelineOperation::Resume => PipelineStatus::Running,
        PipelineOperation::Stop => PipelineStatus::Stopped,
        PipelineOperation::Terminate => PipelineStatus::Terminated,
    }
}

/// Validate an operation request against the current state.
///
/// Re-requesting an operation that is already in flight (or settled) is a
/// no-op rather than an error, so control-plane retries stay safe.
pub fn validate_operation(
    current: PipelineStatus,
    operation: PipelineOperation,
) -> Result<OperationOutcome> {
    let target = requested_state(operation);

    if current == target || current == settled_state(operation) {
        return Ok(OperationOutcome::Noop);
    }

    validate_transition(current, target)?;
    Ok(OperationOutcome::Apply(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineStatus::*;

    const ALLOWED: &[(PipelineStatus, PipelineStatus)] = &[
        (Created, Running),
        (Created, Failed),
        (Running, Pausing),
        (Running, Stopping),
        (Running, Terminating),
        (Running, Failed),
        (Pausing, Paused),
        (Pausing, Failed),
        (Paused, Resuming),
        (Paused, Stopping),
        (Paused, Terminating),
        (Paused, Failed),
        (Resuming, Running),
        (Resuming, Failed),
        (Stopping, Stopped),
        (Stopping, Failed),
        (Stopped, Resuming),
        (Stopped, Terminating),
        (Terminating, Terminated),
        (Terminating, Failed),
        (Failed, Terminating),
    ];

    #[test]
    fn test_table_is_closed() {
        // Every pair not in the table is rejected; every pair in it passes.
        for from in PipelineStatus::ALL {
            for to in PipelineStatus::ALL {
                let allowed = ALLOWED.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    allowed,
                    "transition {from} -> {to}"
                );
                assert_eq!(validate_transition(from, to).is_ok(), allowed);
            }
        }
    }

    #[test]
    fn test_terminated_is_terminal() {
        for to in PipelineStatus::ALL {
            assert!(!can_transition(Terminated, to), "Terminated -> {to}");
        }
    }

    #[test]
    fn test_pause_from_running_applies() {
        assert_eq!(
            validate_operation(Running, PipelineOperation::Pause).unwrap(),
            OperationOutcome::Apply(Pausing)
        );
    }

    #[test]
    fn test_pause_while_pausing_is_noop() {
        assert_eq!(
            validate_operation(Pausing, PipelineOperation::Pause).unwrap(),
            OperationOutcome::Noop
        );
        assert_eq!(
            validate_operation(Paused, PipelineOperation::Pause).unwrap(),
            OperationOutcome::Noop
        );
    }

    #[test]
    fn test_pause_from_stopped_is_rejected() {
        let err = validate_operation(Stopped, PipelineOperation::Pause).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        assert_eq!(
            validate_operation(Running, PipelineOperation::Terminate).unwrap(),
            OperationOutcome::Apply(Terminating)
        );
        assert_eq!(
            validate_operation(Terminating, PipelineOperation::Terminate).unwrap(),
            OperationOutcome::Noop
        );
        assert_eq!(
            validate_operation(Terminated, PipelineOperation::Terminate).unwrap(),
            OperationOutcome::Noop
        );
    }

    #[test]
    fn test_terminate_allowed_from_failed() {
        assert_eq!(
            validate_operation(Failed, PipelineOperation::Terminate).unwrap(),
            OperationOutcome::Apply(Terminating)
        );
    }

    #[test]
    fn test_resume_from_stopped_and_paused() {
        for from in [Paused, Stopped] {
            assert_eq!(
                validate_operation(from, PipelineOperation::Resume).unwrap(),
                OperationOutcome::Apply(Resuming)
            );
        }
    }
}
