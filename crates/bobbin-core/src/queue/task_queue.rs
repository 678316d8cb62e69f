//! TaskQueue: task admission and lease-gated transitions over a `TaskStore`.
//!
//! Every write is read -> reshape -> compare-and-set. A lost race surfaces as
//! `BobbinError::Conflict` (status-gated writes) or `LeaseNotOwned`
//! (owner-gated writes); callers never see `VersionMismatch`.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    BobbinError, Decider, Decision, NodeId, ShardFilter, TaskEnvelope, TaskFailure, TaskId,
    TaskStatus, TaskType, shard_for,
};
use crate::ports::{Clock, IdGenerator, QueueCounts, StoreError, TaskStore, deadline_after};

/// Owner-gated writes re-read and retry this many times when the version
/// moved under them (e.g. a cancel request landed) but the lease is still
/// theirs.
const OWNED_WRITE_RETRIES: usize = 5;

/// Admission limits checked by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitLimits {
    /// Upper bound on the JSON-serialized payload size.
    pub max_payload_bytes: usize,
    pub min_priority: i32,
    pub max_priority: i32,
    /// Ceiling for a submission's `max_attempts`.
    pub max_attempts_ceiling: u32,
    pub shard_count: u32,
}

impl Default for SubmitLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            min_priority: -100,
            max_priority: 100,
            max_attempts_ceiling: 25,
            shard_count: 16,
        }
    }
}

impl SubmitLimits {
    pub fn check(
        &self,
        task_type: &TaskType,
        payload: &serde_json::Value,
        priority: i32,
        max_attempts: u32,
    ) -> Result<(), BobbinError> {
        task_type.validate().map_err(BobbinError::Validation)?;

        if priority < self.min_priority || priority > self.max_priority {
            return Err(BobbinError::Validation(format!(
                "priority {priority} outside [{}, {}]",
                self.min_priority, self.max_priority
            )));
        }
        if max_attempts == 0 || max_attempts > self.max_attempts_ceiling {
            return Err(BobbinError::Validation(format!(
                "max_attempts {max_attempts} outside [1, {}]",
                self.max_attempts_ceiling
            )));
        }

        let size = serde_json::to_vec(payload)
            .map_err(|e| BobbinError::Validation(format!("payload not serializable: {e}")))?
            .len();
        if size > self.max_payload_bytes {
            return Err(BobbinError::Validation(format!(
                "payload is {size} bytes, limit is {}",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

/// What the lease holder learns from a successful renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseState {
    pub expires_at: DateTime<Utc>,
    /// A submitter asked for cancellation; the holder should stop.
    pub cancel_requested: bool,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    limits: SubmitLimits,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        limits: SubmitLimits,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            decider,
            limits,
        }
    }

    pub fn limits(&self) -> &SubmitLimits {
        &self.limits
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Validate, mint an id, pick the shard and enqueue.
    pub async fn submit(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i32,
        max_attempts: u32,
    ) -> Result<TaskId, BobbinError> {
        self.limits
            .check(&task_type, &payload, priority, max_attempts)?;

        let task_id = self.ids.generate_task_id();
        let shard = shard_for(&task_id, self.limits.shard_count);
        let envelope = TaskEnvelope::new(
            task_id,
            task_type,
            payload,
            priority,
            max_attempts,
            shard,
            self.clock.now(),
        );
        self.enqueue(envelope).await?;
        Ok(task_id)
    }

    /// Store a fresh Pending envelope.
    pub async fn enqueue(&self, envelope: TaskEnvelope) -> Result<TaskEnvelope, BobbinError> {
        if envelope.status != TaskStatus::Pending {
            return Err(BobbinError::Validation(format!(
                "cannot enqueue a task in status {}",
                envelope.status
            )));
        }
        envelope
            .check_invariants()
            .map_err(BobbinError::Validation)?;

        let stored = self.store.insert(envelope).await?;
        info!(
            task_id = %stored.task_id,
            task_type = %stored.task_type,
            priority = stored.priority,
            shard = %stored.shard,
            "task enqueued"
        );
        Ok(stored)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<TaskEnvelope, BobbinError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(BobbinError::NotFound(task_id))
    }

    pub async fn counts(&self) -> Result<QueueCounts, BobbinError> {
        Ok(self.store.counts().await?)
    }

    /// Status-gated compare-and-set.
    ///
    /// `fields` reshapes the envelope (lease, result, error, ...); the status
    /// is then forced to `to`. The result must satisfy the envelope
    /// invariants, otherwise nothing is written.
    pub async fn transition<F>(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        fields: F,
    ) -> Result<TaskEnvelope, BobbinError>
    where
        F: FnOnce(&mut TaskEnvelope),
    {
        let current = self.get(task_id).await?;
        if current.status != from {
            return Err(BobbinError::Conflict {
                task_id,
                expected: from,
                actual: current.status,
            });
        }

        let mut next = current.clone();
        fields(&mut next);
        next.status = to;
        next.updated_at = self.clock.now();
        next.check_invariants().map_err(BobbinError::Validation)?;

        self.write_gated(current, next, from).await
    }

    /// Pending tasks in the given shards, best first: priority descending,
    /// then oldest, then lowest task id. Tasks still in retry backoff are
    /// skipped.
    pub async fn peek_pending(
        &self,
        limit: usize,
        shards: &ShardFilter,
    ) -> Result<Vec<TaskEnvelope>, BobbinError> {
        if limit == 0 || shards.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut pending: Vec<TaskEnvelope> = self
            .store
            .list_by_shard_and_status(shards, &[TaskStatus::Pending])
            .await?
            .into_iter()
            .filter(|t| t.is_claimable(now))
            .collect();

        pending.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.task_id));
        pending.truncate(limit);
        Ok(pending)
    }

    /// Pending -> Claimed under a fresh lease. Charges one attempt.
    ///
    /// Of any number of concurrent claims exactly one succeeds; the rest get
    /// `Conflict`.
    pub async fn claim(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        lease_duration: Duration,
    ) -> Result<TaskEnvelope, BobbinError> {
        let current = self.get(task_id).await?;
        if current.status != TaskStatus::Pending || !current.has_attempts_left() {
            return Err(BobbinError::Conflict {
                task_id,
                expected: TaskStatus::Pending,
                actual: current.status,
            });
        }

        let now = self.clock.now();
        let mut next = current.clone();
        next.claim(node_id.clone(), deadline_after(now, lease_duration), now);

        let claimed = self.write_gated(current, next, TaskStatus::Pending).await?;
        debug!(
            %task_id,
            %node_id,
            attempt = claimed.attempts,
            max_attempts = claimed.max_attempts,
            "task claimed"
        );
        Ok(claimed)
    }

    /// Push the lease deadline out to `new_expiry`.
    pub async fn renew_lease(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        new_expiry: DateTime<Utc>,
    ) -> Result<LeaseState, BobbinError> {
        let renewed = self
            .update_owned(task_id, node_id, |next, now| {
                next.renew(new_expiry, now);
                Ok(())
            })
            .await?;
        Ok(LeaseState {
            expires_at: new_expiry,
            cancel_requested: renewed.cancel_requested,
        })
    }

    /// Claimed -> Running.
    pub async fn mark_running(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
    ) -> Result<TaskEnvelope, BobbinError> {
        self.update_owned(task_id, node_id, |next, now| {
            if next.status != TaskStatus::Claimed {
                return Err(BobbinError::Conflict {
                    task_id,
                    expected: TaskStatus::Claimed,
                    actual: next.status,
                });
            }
            next.start(now);
            Ok(())
        })
        .await
    }

    /// Record success. Only the current lease holder may complete.
    pub async fn complete(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        result: serde_json::Value,
    ) -> Result<TaskEnvelope, BobbinError> {
        let done = self
            .update_owned(task_id, node_id, |next, now| {
                next.succeed(result.clone(), now);
                Ok(())
            })
            .await?;
        info!(%task_id, %node_id, attempts = done.attempts, "task succeeded");
        Ok(done)
    }

    /// Record an unsuccessful attempt.
    ///
    /// The decider turns `should_retry` into either a backoff requeue or a
    /// terminal `Failed`. A pending cancel request wins over both.
    pub async fn fail(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        failure: TaskFailure,
        should_retry: bool,
    ) -> Result<TaskEnvelope, BobbinError> {
        let decider = Arc::clone(&self.decider);
        let updated = self
            .update_owned(task_id, node_id, |next, now| {
                if next.cancel_requested {
                    next.cancel(now);
                    return Ok(());
                }
                match decider.decide(next, &failure, should_retry) {
                    Decision::Retry { delay, reason } => {
                        debug!(%task_id, %reason, "requeueing task");
                        next.requeue(failure.clone(), deadline_after(now, delay), now);
                    }
                    Decision::MarkFailed { reason } => {
                        debug!(%task_id, %reason, "failing task");
                        next.fail(failure.clone(), now);
                    }
                }
                Ok(())
            })
            .await?;

        match updated.status {
            TaskStatus::Failed => warn!(
                %task_id,
                %node_id,
                attempts = updated.attempts,
                error = %failure,
                "task failed"
            ),
            TaskStatus::Cancelled => info!(%task_id, %node_id, "task cancelled"),
            _ => info!(
                %task_id,
                %node_id,
                attempts = updated.attempts,
                available_at = %updated.available_at,
                error = %failure,
                "task will be retried"
            ),
        }
        Ok(updated)
    }

    /// Holder-side end of a cancellation: in flight -> Cancelled.
    pub async fn finish_cancelled(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
    ) -> Result<TaskEnvelope, BobbinError> {
        let cancelled = self
            .update_owned(task_id, node_id, |next, now| {
                next.cancel(now);
                Ok(())
            })
            .await?;
        info!(%task_id, %node_id, "task cancelled");
        Ok(cancelled)
    }

    /// Submitter-side cancel.
    ///
    /// Pending tasks are cancelled on the spot; in-flight tasks get a cancel
    /// request that the lease holder (or the recovery sweep) finishes.
    /// Returns false for tasks that already reached a terminal status.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, BobbinError> {
        loop {
            let current = self.get(task_id).await?;
            let now = self.clock.now();
            let mut next = current.clone();

            match current.status {
                s if s.is_terminal() => return Ok(false),
                TaskStatus::Pending => next.cancel(now),
                _ if current.cancel_requested => return Ok(true),
                _ => next.request_cancel(now),
            }

            match self.store.compare_and_set(current.version, next).await {
                Ok(stored) => {
                    info!(%task_id, status = %stored.status, "cancel accepted");
                    return Ok(true);
                }
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Compare-and-set that reports a lost race as `Conflict` on `expected`.
    pub(crate) async fn write_gated(
        &self,
        current: TaskEnvelope,
        next: TaskEnvelope,
        expected: TaskStatus,
    ) -> Result<TaskEnvelope, BobbinError> {
        let task_id = current.task_id;
        match self.store.compare_and_set(current.version, next).await {
            Ok(stored) => Ok(stored),
            Err(StoreError::VersionMismatch { .. }) => {
                let actual = self
                    .store
                    .get(task_id)
                    .await?
                    .map(|t| t.status)
                    .unwrap_or(current.status);
                Err(BobbinError::Conflict {
                    task_id,
                    expected,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read -> check the lease is still ours -> reshape -> compare-and-set.
    async fn update_owned<F>(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        reshape: F,
    ) -> Result<TaskEnvelope, BobbinError>
    where
        F: Fn(&mut TaskEnvelope, DateTime<Utc>) -> Result<(), BobbinError>,
    {
        let mut last_status = TaskStatus::Pending;
        for _ in 0..OWNED_WRITE_RETRIES {
            let current = self.get(task_id).await?;
            let now = self.clock.now();
            if !current.is_owned_by(node_id, now) {
                return Err(BobbinError::LeaseNotOwned {
                    task_id,
                    node_id: node_id.clone(),
                });
            }
            last_status = current.status;

            let mut next = current.clone();
            reshape(&mut next, now)?;
            match self.store.compare_and_set(current.version, next).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::VersionMismatch { .. }) => {
                    debug!(%task_id, %node_id, "version moved under lease holder, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BobbinError::Conflict {
            task_id,
            expected: last_status,
            actual: last_status,
        })
    }
}
