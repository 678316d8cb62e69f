//! TaskClient - submission API
//!
//! # 使用例
//! ```ignore
//! let client = node.client();
//! let id = client.submit_typed(&Resize { image: "a.png".into(), width: 64 }, SubmitOptions::default()).await?;
//! let outcome = client.await_result(id, Duration::from_secs(30)).await?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::status::{TaskOutcome, TaskStatusView};
use crate::domain::{BobbinError, TaskId, TaskType};
use crate::ports::QueueCounts;
use crate::queue::TaskQueue;
use crate::typed::Task;

/// Per-submission overrides. Unset fields fall back to the node defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SubmitDefaults {
    pub priority: i32,
    pub max_attempts: u32,
}

/// Handle for submitters. Cheap to clone.
#[derive(Clone)]
pub struct TaskClient {
    queue: TaskQueue,
    defaults: SubmitDefaults,
    poll_interval: Duration,
    /// Fast path to the local executor when the task runs on this node.
    local_cancel: Option<mpsc::Sender<TaskId>>,
}

impl TaskClient {
    pub(crate) fn new(
        queue: TaskQueue,
        defaults: SubmitDefaults,
        poll_interval: Duration,
        local_cancel: Option<mpsc::Sender<TaskId>>,
    ) -> Self {
        Self {
            queue,
            defaults,
            poll_interval,
            local_cancel,
        }
    }

    /// Submit a raw JSON payload.
    pub async fn submit(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId, BobbinError> {
        self.queue
            .submit(
                task_type.into(),
                payload,
                options.priority.unwrap_or(self.defaults.priority),
                options.max_attempts.unwrap_or(self.defaults.max_attempts),
            )
            .await
    }

    /// Submit a typed task under `T::TYPE`.
    pub async fn submit_typed<T: Task>(
        &self,
        task: &T,
        options: SubmitOptions,
    ) -> Result<TaskId, BobbinError> {
        let payload = serde_json::to_value(task)
            .map_err(|e| BobbinError::Validation(format!("payload encode: {e}")))?;
        self.submit(T::TYPE, payload, options).await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusView, BobbinError> {
        Ok(self.queue.get(task_id).await?.into())
    }

    /// Request cancellation. Returns false if the task had already finished.
    ///
    /// Pending tasks are cancelled at once. In-flight tasks are stopped by
    /// their lease holder at its next renewal, or right away when the holder
    /// is this node.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, BobbinError> {
        let accepted = self.queue.cancel(task_id).await?;
        if accepted && let Some(tx) = &self.local_cancel {
            // full or closed just means the renewal path handles it
            let _ = tx.try_send(task_id);
        }
        Ok(accepted)
    }

    /// Poll until the task reaches a terminal status or `timeout` passes.
    pub async fn await_result(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskOutcome, BobbinError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match self.queue.get(task_id).await {
                Ok(task) => {
                    if let Some(outcome) = TaskStatusView::from(task).outcome() {
                        return Ok(outcome);
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(%task_id, error = %e, "status poll failed, retrying");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BobbinError::AwaitTimeout {
                    task_id,
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Number of tasks per status.
    pub async fn counts(&self) -> Result<QueueCounts, BobbinError> {
        self.queue.counts().await
    }
}
