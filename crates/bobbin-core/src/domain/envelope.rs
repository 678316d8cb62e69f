//! TaskEnvelope - the unit of work plus its metadata and status.
//!
//! The envelope is the single record stored per task. Transition helpers
//! here only reshape the record; the store bumps `version` when a reshaped
//! copy wins its compare-and-set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskFailure;
use super::ids::{NodeId, TaskId};
use super::lease::Lease;
use super::shard::ShardId;
use super::state::TaskStatus;
use super::task_type::TaskType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,

    /// Higher runs first.
    pub priority: i32,
    pub shard: ShardId,

    pub status: TaskStatus,

    /// Attempts charged so far. Charged at claim time.
    pub attempts: u32,
    pub max_attempts: u32,

    /// Set exactly while status is Claimed or Running.
    pub lease: Option<Lease>,

    pub result: Option<serde_json::Value>,
    pub last_error: Option<TaskFailure>,

    /// Set when a cancel arrives while the task is in flight; the owner
    /// (or the recovery sweep) finishes the cancellation.
    #[serde(default)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Pending tasks are not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,

    /// Optimistic concurrency counter. Starts at 1 on insert.
    pub version: u64,
}

impl TaskEnvelope {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i32,
        max_attempts: u32,
        shard: ShardId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            payload,
            priority,
            shard,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            lease: None,
            result: None,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            available_at: now,
            version: 0,
        }
    }

    pub fn lease_owner(&self) -> Option<&NodeId> {
        self.lease.as_ref().map(|l| &l.owner)
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.expires_at)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Claimable by the scheduler at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.available_at <= now && self.has_attempts_left()
    }

    /// In flight with a lease that has run out.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.holds_lease() && self.lease.as_ref().is_some_and(|l| l.is_expired(now))
    }

    /// In flight under a valid lease held by `node`.
    pub fn is_owned_by(&self, node: &NodeId, now: DateTime<Utc>) -> bool {
        self.status.holds_lease() && self.lease.as_ref().is_some_and(|l| l.is_held_by(node, now))
    }

    /// Pending -> Claimed. Charges one attempt.
    pub fn claim(&mut self, owner: NodeId, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Claimed;
        self.attempts += 1;
        self.lease = Some(Lease::new(owner, expires_at));
        self.updated_at = now;
    }

    /// Claimed -> Running.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.updated_at = now;
    }

    pub fn renew(&mut self, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        self.updated_at = now;
    }

    pub fn succeed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.lease = None;
        self.result = Some(result);
        self.updated_at = now;
    }

    /// Back to Pending, claimable again from `available_at`.
    pub fn requeue(&mut self, failure: TaskFailure, available_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.lease = None;
        self.last_error = Some(failure);
        self.available_at = available_at;
        self.updated_at = now;
    }

    pub fn fail(&mut self, failure: TaskFailure, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.lease = None;
        self.last_error = Some(failure);
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.lease = None;
        self.updated_at = now;
    }

    pub fn request_cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = true;
        self.updated_at = now;
    }

    /// Structural invariants every stored envelope must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status.holds_lease() != self.lease.is_some() {
            return Err(format!(
                "{}: status {} with lease {:?}",
                self.task_id, self.status, self.lease
            ));
        }
        if self.attempts > self.max_attempts {
            return Err(format!(
                "{}: attempts {} exceed max {}",
                self.task_id, self.attempts, self.max_attempts
            ));
        }
        Ok(())
    }
}
