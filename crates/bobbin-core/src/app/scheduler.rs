//! Scheduler - claims pending work for this node.
//!
//! Every tick, if the node is neither draining nor partitioned, it takes as
//! many slot permits as it can, peeks that many pending tasks from its own
//! shards and claims them best-first. Each claimed envelope travels to the
//! executor together with the permit that reserves its slot, in claim order.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tracing::{debug, info, warn};

use super::context::{NodeContext, NodeSignals};
use crate::domain::{BobbinError, TaskEnvelope};

/// A claimed task on its way to an execution slot.
pub(crate) struct ClaimedTask {
    pub envelope: TaskEnvelope,
    /// Released when the execution unit finishes.
    pub permit: OwnedSemaphorePermit,
}

pub(crate) struct Scheduler {
    ctx: Arc<NodeContext>,
    signals: Arc<NodeSignals>,
    work_tx: mpsc::Sender<ClaimedTask>,
    store_failures: u32,
}

/// What one scheduling round did.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ClaimRound {
    pub claimed: usize,
    pub conflicts: usize,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<NodeContext>,
        signals: Arc<NodeSignals>,
        work_tx: mpsc::Sender<ClaimedTask>,
    ) -> Self {
        Self {
            ctx,
            signals,
            work_tx,
            store_failures: 0,
        }
    }

    /// Claim up to the number of free slots.
    pub async fn claim_round(&mut self) -> Result<ClaimRound, BobbinError> {
        let mut round = ClaimRound::default();
        if self.signals.paused() {
            return Ok(round);
        }
        let shards = self.signals.owned_shards.borrow().clone();
        if shards.is_empty() {
            return Ok(round);
        }

        let available = self.ctx.slots.available_permits();
        if available == 0 {
            return Ok(round);
        }

        let pending = self.ctx.queue.peek_pending(available, &shards).await?;
        for task in pending {
            // a reassignment can land between peek and claim
            if !self.signals.owned_shards.borrow().matches(task.shard) || self.signals.paused() {
                break;
            }
            let Ok(permit) = Arc::clone(&self.ctx.slots).try_acquire_owned() else {
                break;
            };

            match self
                .ctx
                .queue
                .claim(task.task_id, &self.ctx.node_id, self.ctx.config.lease_duration())
                .await
            {
                Ok(envelope) => {
                    round.claimed += 1;
                    if self.work_tx.send(ClaimedTask { envelope, permit }).await.is_err() {
                        // executor is gone; the lease will lapse and be recovered
                        debug!(node_id = %self.ctx.node_id, "executor closed, stop claiming");
                        break;
                    }
                }
                Err(BobbinError::Conflict { task_id, actual, .. }) => {
                    round.conflicts += 1;
                    debug!(node_id = %self.ctx.node_id, %task_id, %actual, "claim lost to another node");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(round)
    }
}

pub(crate) async fn scheduler_loop(mut scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    let node_id = scheduler.ctx.node_id.clone();
    let interval = scheduler.ctx.config.claim_interval();
    let backoff = scheduler.ctx.config.store_backoff();
    info!(%node_id, capacity = scheduler.ctx.config.capacity, "scheduler started");

    let mut delay = interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                delay = match scheduler.claim_round().await {
                    Ok(round) => {
                        scheduler.store_failures = 0;
                        if round.claimed > 0 {
                            debug!(%node_id, claimed = round.claimed, conflicts = round.conflicts, "claim round");
                        }
                        interval
                    }
                    Err(e) => {
                        scheduler.store_failures += 1;
                        warn!(%node_id, error = %e, failures = scheduler.store_failures, "claim round failed");
                        backoff.next_delay(scheduler.store_failures).max(interval)
                    }
                };
            }
            _ = shutdown.changed() => {
                info!(%node_id, "scheduler shutting down");
                break;
            }
        }
    }
    // dropping `scheduler` closes the work channel, which lets the executor drain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::NodeConfig;
    use crate::domain::{DefaultDecider, ShardFilter, TaskStatus, TaskType};
    use crate::impls::{InMemoryCoordinationStore, InMemoryTaskStore};
    use crate::ports::{Clock, ManualClock, UlidGenerator};
    use crate::queue::{RetryPolicy, TaskQueue};
    use crate::typed::TypedRegistry;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn scheduler(capacity: u32) -> (Scheduler, Arc<NodeSignals>, mpsc::Receiver<ClaimedTask>, TaskQueue) {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let config = NodeConfig::new("a").with_capacity(capacity);
        let queue = TaskQueue::new(
            Arc::new(InMemoryTaskStore::new()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(DefaultDecider::new(RetryPolicy::immediate())),
            config.limits.clone(),
        );
        let ctx = Arc::new(NodeContext {
            node_id: config.node_id(),
            slots: Arc::new(Semaphore::new(capacity as usize)),
            config,
            queue: queue.clone(),
            coordination: Arc::new(InMemoryCoordinationStore::new(clock.clone())),
            registry: Arc::new(TypedRegistry::new()),
            clock,
        });
        let signals = Arc::new(NodeSignals::new());
        signals.owned_shards.send_replace(ShardFilter::All);
        let (tx, rx) = mpsc::channel(16);
        (Scheduler::new(ctx, signals.clone(), tx), signals, rx, queue)
    }

    #[tokio::test]
    async fn claims_no_more_than_free_slots_in_priority_order() {
        let (mut scheduler, _signals, mut rx, queue) = scheduler(2);
        for priority in [1, 5, 3] {
            queue
                .submit(TaskType::new("t.v1"), json!({}), priority, 3)
                .await
                .unwrap();
        }

        let round = scheduler.claim_round().await.unwrap();
        assert_eq!(round.claimed, 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.envelope.priority, 5);
        assert_eq!(second.envelope.priority, 3);
        assert_eq!(first.envelope.status, TaskStatus::Claimed);

        // slots are full until a permit is released
        assert_eq!(scheduler.claim_round().await.unwrap().claimed, 0);
        drop(first);
        let round = scheduler.claim_round().await.unwrap();
        assert_eq!(round.claimed, 1);
        assert_eq!(rx.recv().await.unwrap().envelope.priority, 1);
    }

    #[tokio::test]
    async fn paused_or_shardless_node_claims_nothing() {
        let (mut scheduler, signals, _rx, queue) = scheduler(2);
        queue
            .submit(TaskType::new("t.v1"), json!({}), 0, 3)
            .await
            .unwrap();

        signals.draining.send_replace(true);
        assert_eq!(scheduler.claim_round().await.unwrap(), ClaimRound::default());

        signals.draining.send_replace(false);
        signals.partitioned.send_replace(true);
        assert_eq!(scheduler.claim_round().await.unwrap(), ClaimRound::default());

        signals.partitioned.send_replace(false);
        signals.owned_shards.send_replace(ShardFilter::none());
        assert_eq!(scheduler.claim_round().await.unwrap(), ClaimRound::default());

        signals.owned_shards.send_replace(ShardFilter::All);
        assert_eq!(scheduler.claim_round().await.unwrap().claimed, 1);
    }
}
