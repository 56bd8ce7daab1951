//! Task state machine transitions.
//!
//! Validates state transitions for task runs, enforcing the allowed
//! transition graph and the terminality of `done` and `failed`.

use anyhow::{Result, bail};

use crate::model::{TaskRun, TaskState};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// starting    -> planning
/// planning    -> coding
/// coding      -> diff_applied
/// diff_applied-> testing
/// testing     -> test_report
/// test_report -> done
/// <any non-terminal> -> failed
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
        // Any non-terminal stage may fail.
        if to == TaskState::Failed {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (TaskState::Starting, TaskState::Planning)
                | (TaskState::Planning, TaskState::Coding)
                | (TaskState::Coding, TaskState::DiffApplied)
                | (TaskState::DiffApplied, TaskState::Testing)
                | (TaskState::Testing, TaskState::TestReport)
                | (TaskState::TestReport, TaskState::Done)
        )
    }

    /// The canonical happy-path successor of a stage, if any.
    pub fn next_stage(from: TaskState) -> Option<TaskState> {
        match from {
            TaskState::Starting => Some(TaskState::Planning),
            TaskState::Planning => Some(TaskState::Coding),
            TaskState::Coding => Some(TaskState::DiffApplied),
            TaskState::DiffApplied => Some(TaskState::Testing),
            TaskState::Testing => Some(TaskState::TestReport),
            TaskState::TestReport => Some(TaskState::Done),
            TaskState::Done | TaskState::Failed => None,
        }
    }

    /// Execute a state transition on a run record.
    ///
    /// Returns an error if the edge is not in the graph, in particular for
    /// any transition out of a terminal state.
    pub fn transition(run: &mut TaskRun, to: TaskState) -> Result<()> {
        let from = run.state;
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                run.task_id
            );
        }
        run.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskRequest, Template};

    fn test_run() -> TaskRun {
        TaskRun::new(&TaskRequest {
            task_id: "t1".to_string(),
            template: Template::Generic,
            instruction: "do a thing".to_string(),
            model: None,
        })
    }

    #[test]
    fn canonical_path_is_valid() {
        let path = [
            TaskState::Starting,
            TaskState::Planning,
            TaskState::Coding,
            TaskState::DiffApplied,
            TaskState::Testing,
            TaskState::TestReport,
            TaskState::Done,
        ];
        for pair in path.windows(2) {
            assert!(
                TaskStateMachine::is_valid_transition(pair[0], pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn any_non_terminal_stage_can_fail() {
        for from in [
            TaskState::Starting,
            TaskState::Planning,
            TaskState::Coding,
            TaskState::DiffApplied,
            TaskState::Testing,
            TaskState::TestReport,
        ] {
            assert!(TaskStateMachine::is_valid_transition(from, TaskState::Failed));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in [
            TaskState::Starting,
            TaskState::Planning,
            TaskState::Done,
            TaskState::Failed,
        ] {
            assert!(!TaskStateMachine::is_valid_transition(TaskState::Done, to));
            assert!(!TaskStateMachine::is_valid_transition(TaskState::Failed, to));
        }
    }

    #[test]
    fn skipping_stages_is_invalid() {
        assert!(!TaskStateMachine::is_valid_transition(
            TaskState::Starting,
            TaskState::Coding
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            TaskState::Planning,
            TaskState::Done
        ));
    }

    #[test]
    fn transition_mutates_run_state() {
        let mut run = test_run();
        TaskStateMachine::transition(&mut run, TaskState::Planning).unwrap();
        assert_eq!(run.state, TaskState::Planning);
    }

    #[test]
    fn transition_out_of_terminal_errors() {
        let mut run = test_run();
        run.state = TaskState::Done;
        let err = TaskStateMachine::transition(&mut run, TaskState::Failed)
            .expect_err("done is terminal");
        assert!(err.to_string().contains("invalid state transition"));
    }

    #[test]
    fn next_stage_walks_the_canonical_sequence() {
        let mut stage = TaskState::Starting;
        let mut seen = vec![stage];
        while let Some(next) = TaskStateMachine::next_stage(stage) {
            seen.push(next);
            stage = next;
        }
        assert_eq!(*seen.last().unwrap(), TaskState::Done);
        assert_eq!(seen.len(), 7);
    }
}
