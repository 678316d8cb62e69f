//! Expired-lease recovery.
//!
//! A sweep reclaims Claimed/Running tasks whose lease deadline has passed.
//! Each reclaim is a compare-and-set gated on the version read together with
//! the expired lease, so concurrent sweeps over the same task produce exactly
//! one reset; the losers see `Conflict`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::TaskQueue;
use crate::domain::{BobbinError, ShardFilter, TaskEnvelope, TaskFailure, TaskId, TaskStatus};

/// What a single reclaim did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Back to Pending. The attempt was charged at claim time.
    Requeued,
    /// Attempts exhausted; Failed with `LeaseExpired`.
    Failed,
    /// A cancel request was outstanding.
    Cancelled,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Reclaims lost to a concurrent writer.
    pub conflicts: usize,
}

impl SweepReport {
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.failed + self.cancelled
    }

    fn record(&mut self, outcome: RecoveryOutcome) {
        match outcome {
            RecoveryOutcome::Requeued => self.requeued += 1,
            RecoveryOutcome::Failed => self.failed += 1,
            RecoveryOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

impl TaskQueue {
    /// Reclaim one task whose lease has expired.
    ///
    /// Fails with `Conflict` when the task is not in flight, its lease is
    /// still valid, or another writer got there first.
    pub async fn reclaim_expired(&self, task_id: TaskId) -> Result<RecoveryOutcome, BobbinError> {
        let current = self.get(task_id).await?;
        self.reclaim(current).await
    }

    /// Sweep the given shards once.
    pub async fn recover_expired(&self, shards: &ShardFilter) -> Result<SweepReport, BobbinError> {
        let mut report = SweepReport::default();
        if shards.is_empty() {
            return Ok(report);
        }

        let now = self.clock().now();
        let candidates = self
            .list_in_flight(shards)
            .await?
            .into_iter()
            .filter(|t| t.is_lease_expired(now));

        for task in candidates {
            report.scanned += 1;
            match self.reclaim(task).await {
                Ok(outcome) => report.record(outcome),
                Err(BobbinError::Conflict { task_id, .. }) => {
                    debug!(%task_id, "expired lease already handled elsewhere");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.reclaimed() > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                cancelled = report.cancelled,
                conflicts = report.conflicts,
                "recovered expired leases"
            );
        }
        Ok(report)
    }

    async fn list_in_flight(&self, shards: &ShardFilter) -> Result<Vec<TaskEnvelope>, BobbinError> {
        Ok(self
            .store()
            .list_by_shard_and_status(shards, &[TaskStatus::Claimed, TaskStatus::Running])
            .await?)
    }

    async fn reclaim(&self, current: TaskEnvelope) -> Result<RecoveryOutcome, BobbinError> {
        let now = self.clock().now();
        let task_id = current.task_id;
        if !current.is_lease_expired(now) {
            return Err(BobbinError::Conflict {
                task_id,
                expected: current.status,
                actual: current.status,
            });
        }

        let previous_owner = current.lease_owner().cloned();
        let failure = previous_owner
            .as_ref()
            .map(TaskFailure::lease_expired)
            .unwrap_or_else(|| TaskFailure::handler("lease vanished"));

        let mut next = current.clone();
        let outcome = if current.cancel_requested {
            next.cancel(now);
            RecoveryOutcome::Cancelled
        } else if current.has_attempts_left() {
            next.requeue(failure, now, now);
            RecoveryOutcome::Requeued
        } else {
            next.fail(failure, now);
            RecoveryOutcome::Failed
        };

        let expected = current.status;
        self.write_gated(current, next, expected).await?;

        match outcome {
            RecoveryOutcome::Failed => warn!(
                %task_id,
                owner = ?previous_owner,
                "lease expired with no attempts left, task failed"
            ),
            _ => info!(%task_id, owner = ?previous_owner, ?outcome, "reclaimed expired lease"),
        }
        Ok(outcome)
    }
}
