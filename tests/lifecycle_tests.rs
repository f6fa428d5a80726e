//! Lifecycle state machine tests.
//!
//! Covers the closed transition table, operation idempotence, and the
//! rejection paths the control plane depends on.

use proptest::prelude::*;
use rstest::rstest;
use streamforge::error::PipelineError;
use streamforge::lifecycle::{
    can_transition, requested_state, validate_operation, validate_transition, OperationOutcome,
};
use streamforge::models::PipelineOperation as Op;
use streamforge::models::PipelineStatus::*;
use streamforge::models::{PipelineOperation, PipelineStatus};

#[rstest]
#[case(Created, Running, true)]
#[case(Created, Paused, false)]
#[case(Running, Pausing, true)]
#[case(Running, Paused, false)]
#[case(Pausing, Paused, true)]
#[case(Paused, Resuming, true)]
#[case(Paused, Running, false)]
#[case(Resuming, Running, true)]
#[case(Stopping, Stopped, true)]
#[case(Stopped, Resuming, true)]
#[case(Stopped, Pausing, false)]
#[case(Terminating, Terminated, true)]
#[case(Terminated, Running, false)]
#[case(Failed, Terminating, true)]
#[case(Failed, Running, false)]
fn test_transition_table(
    #[case] from: PipelineStatus,
    #[case] to: PipelineStatus,
    #[case] allowed: bool,
) {
    assert_eq!(can_transition(from, to), allowed, "{from} -> {to}");
}

#[test]
fn test_rejection_carries_both_states() {
    let err = validate_transition(Stopped, Pausing).unwrap_err();
    match err {
        PipelineError::InvalidStateTransition { from, requested } => {
            assert_eq!(from, "stopped");
            assert_eq!(requested, "pausing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Scenario: a stopped pipeline receives a pause request. The operation is
/// rejected and nothing about the pipeline changes.
#[test]
fn test_pause_of_stopped_pipeline_is_rejected() {
    let err = validate_operation(Stopped, Op::Pause).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition { .. }));
}

#[rstest]
#[case(Running, Op::Pause, OperationOutcome::Apply(Pausing))]
#[case(Pausing, Op::Pause, OperationOutcome::Noop)]
#[case(Paused, Op::Pause, OperationOutcome::Noop)]
#[case(Paused, Op::Resume, OperationOutcome::Apply(Resuming))]
#[case(Stopped, Op::Resume, OperationOutcome::Apply(Resuming))]
#[case(Running, Op::Resume, OperationOutcome::Noop)]
#[case(Running, Op::Stop, OperationOutcome::Apply(Stopping))]
#[case(Paused, Op::Stop, OperationOutcome::Apply(Stopping))]
#[case(Stopping, Op::Stop, OperationOutcome::Noop)]
#[case(Running, Op::Terminate, OperationOutcome::Apply(Terminating))]
#[case(Failed, Op::Terminate, OperationOutcome::Apply(Terminating))]
#[case(Terminating, Op::Terminate, OperationOutcome::Noop)]
#[case(Terminated, Op::Terminate, OperationOutcome::Noop)]
fn test_operation_outcomes(
    #[case] current: PipelineStatus,
    #[case] operation: PipelineOperation,
    #[case] expected: OperationOutcome,
) {
    assert_eq!(validate_operation(current, operation).unwrap(), expected);
}

/// Two consecutive terminates never error and never double-apply.
#[test]
fn test_terminate_is_idempotent_end_to_end() {
    let first = validate_operation(Running, Op::Terminate).unwrap();
    assert_eq!(first, OperationOutcome::Apply(Terminating));

    for current in [Terminating, Terminated] {
        assert_eq!(
            validate_operation(current, Op::Terminate).unwrap(),
            OperationOutcome::Noop
        );
    }
}

fn any_status() -> impl Strategy<Value = PipelineStatus> {
    prop::sample::select(PipelineStatus::ALL.to_vec())
}

fn any_operation() -> impl Strategy<Value = PipelineOperation> {
    prop::sample::select(vec![
        Op::Create,
        Op::Start,
        Op::Pause,
        Op::Resume,
        Op::Stop,
        Op::Terminate,
    ])
}

proptest! {
    /// Closure: every operation either maps to a listed transition, is a
    /// no-op, or is rejected; it never produces an unlisted state move.
    #[test]
    fn prop_operations_never_escape_the_table(
        current in any_status(),
        operation in any_operation(),
    ) {
        match validate_operation(current, operation) {
            Ok(OperationOutcome::Apply(next)) => {
                prop_assert!(can_transition(current, next));
                prop_assert_eq!(next, requested_state(operation));
            }
            Ok(OperationOutcome::Noop) => {}
            Err(PipelineError::InvalidStateTransition { .. }) => {
                prop_assert!(!can_transition(current, requested_state(operation)));
            }
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }

    /// Terminated has no outgoing edge under any operation.
    #[test]
    fn prop_terminated_is_terminal(operation in any_operation()) {
        match validate_operation(Terminated, operation) {
            Ok(OperationOutcome::Apply(next)) => {
                prop_assert!(false, "Terminated moved to {}", next);
            }
            Ok(OperationOutcome::Noop) | Err(_) => {}
        }
    }
}
