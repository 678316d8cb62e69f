//! ReaperLoop - 期限切れ lease の回収
//!
//! Every `sweep_interval` the node sweeps the shards it owns for Claimed or
//! Running tasks whose lease ran out, and hands them back to the queue
//! (see [`TaskQueue::recover_expired`](crate::queue::TaskQueue::recover_expired)).
//! Sweeps on different nodes may overlap during a reassignment; the CAS in
//! the queue lets exactly one of them win per task.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::{NodeContext, NodeSignals};
use crate::domain::BobbinError;
use crate::queue::SweepReport;

pub(crate) struct Reaper {
    ctx: Arc<NodeContext>,
    signals: Arc<NodeSignals>,
}

impl Reaper {
    pub fn new(ctx: Arc<NodeContext>, signals: Arc<NodeSignals>) -> Self {
        Self { ctx, signals }
    }

    /// One sweep over the owned shards. Partitioned nodes skip it: their view
    /// of ownership may already be stale.
    pub async fn sweep_once(&self) -> Result<SweepReport, BobbinError> {
        if *self.signals.partitioned.borrow() {
            return Ok(SweepReport::default());
        }
        let shards = self.signals.owned_shards.borrow().clone();
        if shards.is_empty() {
            return Ok(SweepReport::default());
        }
        self.ctx.queue.recover_expired(&shards).await
    }
}

pub(crate) async fn reaper_loop(reaper: Reaper, mut shutdown: watch::Receiver<bool>) {
    let node_id = reaper.ctx.node_id.clone();
    let interval = reaper.ctx.config.sweep_interval();
    info!(%node_id, ?interval, "reaper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match reaper.sweep_once().await {
                    Ok(report) if report.reclaimed() > 0 => info!(
                        %node_id,
                        requeued = report.requeued,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        conflicts = report.conflicts,
                        "recovered expired leases"
                    ),
                    Ok(report) => debug!(%node_id, scanned = report.scanned, "sweep found nothing"),
                    Err(e) => warn!(%node_id, error = %e, "recovery sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!(%node_id, "reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::NodeConfig;
    use crate::domain::{DefaultDecider, NodeId, ShardFilter, TaskStatus, TaskType};
    use crate::impls::{InMemoryCoordinationStore, InMemoryTaskStore};
    use crate::ports::{Clock, ManualClock, UlidGenerator};
    use crate::queue::{RetryPolicy, TaskQueue};
    use crate::typed::TypedRegistry;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn reaper() -> (Reaper, Arc<NodeSignals>, TaskQueue, ManualClock) {
        let manual = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(manual.clone());
        let config = NodeConfig::new("sweeper");
        let queue = TaskQueue::new(
            Arc::new(InMemoryTaskStore::new()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(DefaultDecider::new(RetryPolicy::immediate())),
            config.limits.clone(),
        );
        let ctx = Arc::new(NodeContext {
            node_id: config.node_id(),
            slots: Arc::new(Semaphore::new(config.capacity as usize)),
            config,
            queue: queue.clone(),
            coordination: Arc::new(InMemoryCoordinationStore::new(clock.clone())),
            registry: Arc::new(TypedRegistry::new()),
            clock,
        });
        let signals = Arc::new(NodeSignals::new());
        (Reaper::new(ctx, signals.clone()), signals, queue, manual)
    }

    #[tokio::test]
    async fn sweeps_only_owned_shards_of_a_reachable_node() {
        let (reaper, signals, queue, clock) = reaper();
        let id = queue
            .submit(TaskType::new("t.v1"), json!({}), 0, 3)
            .await
            .unwrap();
        queue
            .claim(id, &NodeId::new("dead-node"), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));

        // no shards yet
        assert_eq!(reaper.sweep_once().await.unwrap(), SweepReport::default());

        signals.owned_shards.send_replace(ShardFilter::All);
        signals.partitioned.send_replace(true);
        assert_eq!(reaper.sweep_once().await.unwrap(), SweepReport::default());

        signals.partitioned.send_replace(false);
        let report = reaper.sweep_once().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(queue.get(id).await.unwrap().status, TaskStatus::Pending);
    }
}
