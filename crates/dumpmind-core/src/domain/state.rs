//! Task status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Running (a worker claims the task)
/// - Running -> Success
/// - Running -> Failed
///
/// Running and the terminal states never go back to Pending. A failed task is
/// not retried; a retry is a new task with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,

    /// Claimed and being executed.
    Running,

    /// Pipeline finished (with or without a crash dump).
    Success,

    /// Pipeline hit an unrecoverable error.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Can a worker claim a task in this state?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Pending, false, true)]
    #[case(TaskStatus::Running, false, false)]
    #[case(TaskStatus::Success, true, false)]
    #[case(TaskStatus::Failed, true, false)]
    fn status_classification(
        #[case] status: TaskStatus,
        #[case] terminal: bool,
        #[case] claimable: bool,
    ) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_claimable(), claimable);
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&TaskStatus::Success).unwrap();
        assert_eq!(s, "\"success\"");
    }
}
