//! Errors - caller-facing error type and recorded task failures.
//!
//! Two families:
//! - `BobbinError`: returned from API calls (validation, conflicts, lease loss)
//! - `TaskFailure`: stored on the envelope as `last_error`, visible to submitters

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{NodeId, TaskId};
use super::state::TaskStatus;
use super::task_type::TaskType;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum BobbinError {
    /// Bad submission input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic concurrency violation. Re-read, then retry or abandon.
    #[error("conflict on {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// Stale claim or renewal. The caller must stop acting as owner.
    #[error("lease on {task_id} is not owned by {node_id}")]
    LeaseNotOwned { task_id: TaskId, node_id: NodeId },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    /// `await_result` gave up before the task reached a terminal status.
    #[error("task {task_id} not finished after {waited:?}")]
    AwaitTimeout {
        task_id: TaskId,
        waited: std::time::Duration,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BobbinError {
    /// Transient errors are worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BobbinError::Store(e) if e.is_transient())
    }
}

/// Classification of a handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried while attempts remain.
    Transient,
    /// Retrying cannot help; the task fails immediately.
    Permanent,
}

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Exceeded the execution budget.
    Timeout,
    /// The handler returned an error, panicked, or was missing.
    HandlerError,
    /// The owner stopped renewing and the recovery sweep reclaimed the task.
    LeaseExpired,
}

/// A failure recorded on the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("timed out after {after:?}"))
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerError, message)
    }

    pub fn lease_expired(owner: &NodeId) -> Self {
        Self::new(
            FailureKind::LeaseExpired,
            format!("lease held by {owner} expired"),
        )
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
