//! TaskStore port - the durable record of every task envelope.
//!
//! The store is an external, replicated key-value store. The core assumes
//! only per-key linearizable operations:
//! - `insert` fails if the key exists
//! - `compare_and_set` replaces the envelope only when the stored version
//!   still equals the expected one, and bumps the version
//!
//! Claims, renewals, completions and the recovery sweep are all built on
//! top of `compare_and_set` (see `queue::TaskQueue`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{NodeId, ShardFilter, TaskEnvelope, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("version mismatch on {task_id}: expected {expected}, found {actual}")]
    VersionMismatch {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Coordination write attempted without holding the leader lock.
    #[error("{0} does not hold the leader lock")]
    NotLeader(NodeId),

    #[error("stale shard assignment: stored version {stored}, offered {offered}")]
    StaleAssignment { stored: u64, offered: u64 },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Task counts by status (the "store state" view).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.claimed + self.running
    }

    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new envelope. The stored copy starts at version 1.
    async fn insert(&self, envelope: TaskEnvelope) -> Result<TaskEnvelope, StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskEnvelope>, StoreError>;

    /// Replace the envelope if its stored version is still `expected_version`.
    /// Returns the stored copy with the bumped version.
    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: TaskEnvelope,
    ) -> Result<TaskEnvelope, StoreError>;

    /// Envelopes in the given shards whose status is one of `statuses`.
    /// No ordering is promised.
    async fn list_by_shard_and_status(
        &self,
        shards: &ShardFilter,
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskEnvelope>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
