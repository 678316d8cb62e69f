//! Status - submitter 向けのタスク状態
//!
//! Submitters see statuses and terminal results only. Lease owners, versions
//! and claim conflicts stay inside the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskEnvelope, TaskFailure, TaskId, TaskStatus, TaskType};
use crate::typed::Task;

/// Snapshot of one task as a submitter sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TaskEnvelope> for TaskStatusView {
    fn from(task: TaskEnvelope) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type,
            status: task.status,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            result: task.result,
            error: task.last_error,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl TaskStatusView {
    /// The terminal outcome, or `None` while the task is still live.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Succeeded => Some(TaskOutcome::Succeeded(
                self.result.clone().unwrap_or(serde_json::Value::Null),
            )),
            TaskStatus::Failed => Some(TaskOutcome::Failed(self.error.clone().unwrap_or_else(
                || TaskFailure::handler("failed without a recorded error"),
            ))),
            TaskStatus::Cancelled => Some(TaskOutcome::Cancelled),
            TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Running => None,
        }
    }
}

/// How a task finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(serde_json::Value),
    Failed(TaskFailure),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }

    /// Decode a successful result as the output of `T`.
    ///
    /// Returns `None` unless the task succeeded.
    pub fn output<T: Task>(&self) -> Option<Result<T::Output, serde_json::Error>> {
        match self {
            TaskOutcome::Succeeded(value) => Some(serde_json::from_value(value.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeId, ShardId};
    use crate::typed::handler::fixtures::Add;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn envelope() -> TaskEnvelope {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut env = TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("math.add.v1"),
            json!({"a": 1, "b": 2}),
            0,
            3,
            ShardId(0),
            t0,
        );
        env.claim(NodeId::new("a"), t0 + chrono::Duration::seconds(30), t0);
        env
    }

    #[test]
    fn live_task_has_no_outcome() {
        let view = TaskStatusView::from(envelope());
        assert_eq!(view.status, TaskStatus::Claimed);
        assert_eq!(view.outcome(), None);
    }

    #[test]
    fn success_decodes_as_typed_output() {
        let mut env = envelope();
        env.succeed(json!(3), env.updated_at);

        let outcome = TaskStatusView::from(env).outcome().unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.output::<Add>().unwrap().unwrap(), 3);
    }

    #[test]
    fn failure_carries_the_recorded_error() {
        let mut env = envelope();
        env.fail(TaskFailure::handler("boom"), env.updated_at);

        let outcome = TaskStatusView::from(env).outcome().unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(TaskFailure::handler("boom")));
        assert_eq!(outcome.output::<Add>().map(|r| r.is_ok()), None);
    }
}
