//! Allowed task state transitions.

use thiserror::Error;

use crate::core::types::TaskState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for task '{task}': {from:?} -> {to:?}")]
pub struct TransitionError {
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// True if `from -> to` is a legal lifecycle edge.
///
/// `Running -> Verifying` cannot be skipped on the success path: `Passed` is
/// only reachable from `Verifying`. Recovery edges (`in-flight -> Ready`) are
/// included so a restart can reconcile stale tasks.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::{Blocked, Done, Failed, Passed, Pending, Ready, Retrying, Running, Verifying};
    match (from, to) {
        (Pending, Ready) => true,
        (Ready, Running) => true,
        (Running, Verifying) => true,
        (Running, Failed) => true,
        (Verifying, Passed) => true,
        (Verifying, Failed) => true,
        (Passed, Done) => true,
        // Commit failure after approval.
        (Passed, Failed) => true,
        (Failed, Retrying) => true,
        (Failed, Blocked) => true,
        (Retrying, Running) => true,
        (Running | Verifying | Passed | Failed | Retrying, Ready) => true,
        _ => false,
    }
}

pub fn check_transition(task: &str, from: TaskState, to: TaskState) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        return Ok(());
    }
    Err(TransitionError {
        task: task.to_string(),
        from,
        to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_strictly_ordered() {
        let path = [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Running,
            TaskState::Verifying,
            TaskState::Passed,
            TaskState::Done,
        ];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{pair:?}");
        }
        assert!(!can_transition(TaskState::Running, TaskState::Passed));
        assert!(!can_transition(TaskState::Running, TaskState::Done));
        assert!(!can_transition(TaskState::Ready, TaskState::Verifying));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Running,
            TaskState::Retrying,
        ] {
            assert!(!can_transition(TaskState::Done, to));
            assert!(!can_transition(TaskState::Blocked, to));
        }
    }

    #[test]
    fn retry_path_goes_through_failed_and_retrying() {
        assert!(can_transition(TaskState::Failed, TaskState::Retrying));
        assert!(can_transition(TaskState::Retrying, TaskState::Running));
        assert!(!can_transition(TaskState::Failed, TaskState::Running));
    }

    #[test]
    fn check_transition_reports_edge() {
        let err = check_transition("t1", TaskState::Pending, TaskState::Done).unwrap_err();
        assert_eq!(err.task, "t1");
        assert!(err.to_string().contains("Pending -> Done"));
    }
}
