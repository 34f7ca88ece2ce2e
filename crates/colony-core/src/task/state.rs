//! Task state machine.
//!
//! Validates state transitions for tasks, enforcing the allowed transition
//! graph and sticky terminal states. Execution happens in the repository
//! with optimistic locking; this module is the pure edge check.

use colony_db::models::TaskStatus;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued         -> assigned
/// assigned       -> in_progress
/// assigned       -> queued          (redelivery)
/// in_progress    -> queued          (redelivery)
/// in_progress    -> review_pending
/// in_progress    -> completed
/// in_progress    -> failed
/// review_pending -> approved | rejected | rework_needed | escalated
/// rework_needed  -> assigned
/// rejected       -> failed
/// approved       -> completed
/// escalated      -> approved | rejected   (external resolution)
/// any non-terminal -> cancelled
/// ```
///
/// The redelivery edges back to `queued` carry the at-least-once contract:
/// a dead or unregistered worker's task is handed to the next claimant.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        if from == to {
            return false;
        }
        // Terminal states are sticky.
        if from.is_terminal() {
            return false;
        }
        // Cancellation is reachable from every non-terminal state.
        if to == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (from, to),
            (TaskStatus::Queued, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::InProgress)
                | (TaskStatus::Assigned, TaskStatus::Queued)
                | (TaskStatus::InProgress, TaskStatus::Queued)
                | (TaskStatus::InProgress, TaskStatus::ReviewPending)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::ReviewPending, TaskStatus::Approved)
                | (TaskStatus::ReviewPending, TaskStatus::Rejected)
                | (TaskStatus::ReviewPending, TaskStatus::ReworkNeeded)
                | (TaskStatus::ReviewPending, TaskStatus::Escalated)
                | (TaskStatus::ReworkNeeded, TaskStatus::Assigned)
                | (TaskStatus::Rejected, TaskStatus::Failed)
                | (TaskStatus::Approved, TaskStatus::Completed)
                | (TaskStatus::Escalated, TaskStatus::Approved)
                | (TaskStatus::Escalated, TaskStatus::Rejected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_accepted() {
        let valid = [
            (TaskStatus::Queued, TaskStatus::Assigned),
            (TaskStatus::Assigned, TaskStatus::InProgress),
            (TaskStatus::InProgress, TaskStatus::ReviewPending),
            (TaskStatus::InProgress, TaskStatus::Completed),
            (TaskStatus::InProgress, TaskStatus::Failed),
            (TaskStatus::ReviewPending, TaskStatus::Approved),
            (TaskStatus::ReviewPending, TaskStatus::ReworkNeeded),
            (TaskStatus::ReworkNeeded, TaskStatus::Assigned),
            (TaskStatus::Rejected, TaskStatus::Failed),
            (TaskStatus::Approved, TaskStatus::Completed),
            (TaskStatus::Escalated, TaskStatus::Approved),
        ];
        for (from, to) in &valid {
            assert!(
                TaskStateMachine::is_valid_transition(*from, *to),
                "expected {from} -> {to} to be valid"
            );
        }
    }

    #[test]
    fn redelivery_edges_accepted() {
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::Assigned,
            TaskStatus::Queued
        ));
        assert!(TaskStateMachine::is_valid_transition(
            TaskStatus::InProgress,
            TaskStatus::Queued
        ));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for target in [
                TaskStatus::Queued,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !TaskStateMachine::is_valid_transition(terminal, target),
                    "expected {terminal} -> {target} to be rejected"
                );
            }
        }
    }

    #[test]
    fn cancel_reachable_from_all_non_terminal() {
        for from in [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::ReviewPending,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::ReworkNeeded,
            TaskStatus::Escalated,
        ] {
            assert!(
                TaskStateMachine::is_valid_transition(from, TaskStatus::Cancelled),
                "expected {from} -> cancelled to be valid"
            );
        }
    }

    #[test]
    fn skipping_states_rejected() {
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Queued,
            TaskStatus::Completed
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Queued,
            TaskStatus::InProgress
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskStatus::Assigned,
            TaskStatus::Completed
        ));
    }
}
