//! Membership - heartbeats, node state tracking, leader duties.
//!
//! Two loops per node:
//! - the heartbeat loop writes this node's record and notices when the store
//!   has been unreachable for longer than the dead timeout (partitioned)
//! - the coordination loop classifies every node, logs state changes, runs
//!   the leader lock and, while leader, reaps dead records and publishes the
//!   shard assignment; every node then picks its own shards out of it

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::context::{NodeContext, NodeSignals};
use crate::domain::{
    LeaderLease, NodeId, NodeRecord, NodeState, NodeView, ShardAssignment, ShardFilter,
};
use crate::ports::StoreError;

/// Classify every record as seen at the context clock's `now`.
pub(crate) fn classify_all(ctx: &NodeContext, records: Vec<NodeRecord>) -> Vec<NodeView> {
    let now = ctx.clock.now();
    let interval = ctx.config.heartbeat_interval();
    let dead_after = ctx.config.dead_after();
    records
        .into_iter()
        .map(|record| {
            let state = record.classify(now, interval, dead_after);
            NodeView { record, state }
        })
        .collect()
}

/// Nodes that should own shards: live and not draining. If every live node
/// is draining they all keep their shards, so work is never orphaned.
pub(crate) fn assignment_members(views: &[NodeView]) -> Vec<NodeId> {
    let live: Vec<&NodeView> = views.iter().filter(|v| v.state.is_live()).collect();
    let serving: Vec<NodeId> = live
        .iter()
        .filter(|v| !v.record.draining)
        .map(|v| v.record.node_id.clone())
        .collect();
    if serving.is_empty() {
        live.iter().map(|v| v.record.node_id.clone()).collect()
    } else {
        serving
    }
}

fn needs_publish(
    current: Option<&ShardAssignment>,
    epoch: u64,
    members: &[NodeId],
    shard_count: u32,
) -> bool {
    let Some(current) = current else {
        return true;
    };
    let wanted: BTreeSet<NodeId> = members.iter().cloned().collect();
    current.epoch != epoch
        || current.owners.len() != shard_count as usize
        || current.members() != wanted
}

pub(crate) struct Membership {
    ctx: Arc<NodeContext>,
    signals: Arc<NodeSignals>,
    /// Last state logged per node.
    known: HashMap<NodeId, NodeState>,
    leader_epoch: Option<u64>,
    last_store_contact: Instant,
    heartbeat_failures: u32,
}

impl Membership {
    pub fn new(ctx: Arc<NodeContext>, signals: Arc<NodeSignals>) -> Self {
        Self {
            ctx,
            signals,
            known: HashMap::new(),
            leader_epoch: None,
            last_store_contact: Instant::now(),
            heartbeat_failures: 0,
        }
    }

    /// Write one heartbeat. Returns the delay before the next one: the
    /// interval after a success, a shorter backoff after a failure.
    pub async fn heartbeat_once(&mut self) -> Duration {
        let ctx = &self.ctx;
        let interval = ctx.config.heartbeat_interval();
        let record = NodeRecord::heartbeat(
            ctx.node_id.clone(),
            ctx.config.capacity,
            ctx.in_flight(),
            ctx.clock.now(),
        );

        match ctx.coordination.heartbeat(record).await {
            Ok(stored) => {
                self.last_store_contact = Instant::now();
                self.heartbeat_failures = 0;
                debug!(
                    node_id = %ctx.node_id,
                    seq = stored.heartbeat_seq,
                    load = stored.current_load,
                    "heartbeat sent"
                );

                if self.signals.partitioned.send_replace(false) {
                    info!(node_id = %ctx.node_id, "store reachable again, resuming claims");
                }
                let draining = stored.draining;
                if self.signals.draining.send_replace(draining) != draining {
                    if draining {
                        info!(node_id = %ctx.node_id, "node draining, no new claims");
                    } else {
                        info!(node_id = %ctx.node_id, "node resumed");
                    }
                }
                interval
            }
            Err(e) => {
                self.heartbeat_failures += 1;
                let silent_for = self.last_store_contact.elapsed();
                warn!(
                    node_id = %ctx.node_id,
                    error = %e,
                    failures = self.heartbeat_failures,
                    ?silent_for,
                    "heartbeat failed"
                );
                if silent_for > ctx.config.dead_after() && !self.signals.partitioned.send_replace(true) {
                    warn!(
                        node_id = %ctx.node_id,
                        ?silent_for,
                        "store unreachable past the dead timeout, treating node as partitioned"
                    );
                }
                ctx.config
                    .store_backoff()
                    .next_delay(self.heartbeat_failures)
                    .min(interval)
            }
        }
    }

    /// One coordination round.
    pub async fn coordinate_once(&mut self) -> Result<(), StoreError> {
        let records = self.ctx.coordination.list_nodes().await?;
        let views = classify_all(&self.ctx, records);
        self.log_transitions(&views);

        let lease = self
            .ctx
            .coordination
            .acquire_leadership(&self.ctx.node_id, self.ctx.config.dead_after())
            .await?;
        self.track_leadership(lease.as_ref());
        if let Some(lease) = lease {
            self.lead(&lease, &views).await?;
        }

        self.refresh_owned_shards().await
    }

    fn log_transitions(&mut self, views: &[NodeView]) {
        let mut seen = BTreeSet::new();
        for view in views {
            let node_id = &view.record.node_id;
            seen.insert(node_id.clone());
            let previous = self.known.insert(node_id.clone(), view.state);
            if previous == Some(view.state) {
                continue;
            }
            match view.state {
                NodeState::Joining | NodeState::Active => info!(
                    observer = %self.ctx.node_id,
                    %node_id,
                    from = ?previous,
                    to = ?view.state,
                    "node state changed"
                ),
                NodeState::Suspected | NodeState::Dead => warn!(
                    observer = %self.ctx.node_id,
                    %node_id,
                    from = ?previous,
                    to = ?view.state,
                    last_heartbeat = %view.record.last_heartbeat,
                    "node state changed"
                ),
            }
        }
        self.known.retain(|node_id, _| seen.contains(node_id));
    }

    fn track_leadership(&mut self, lease: Option<&LeaderLease>) {
        let epoch = lease.map(|l| l.epoch);
        if epoch == self.leader_epoch {
            return;
        }
        match epoch {
            Some(epoch) => info!(node_id = %self.ctx.node_id, epoch, "acquired leadership"),
            None => info!(node_id = %self.ctx.node_id, "no longer leader"),
        }
        self.leader_epoch = epoch;
    }

    async fn lead(&self, lease: &LeaderLease, views: &[NodeView]) -> Result<(), StoreError> {
        for view in views.iter().filter(|v| v.state == NodeState::Dead) {
            let node_id = &view.record.node_id;
            if self.ctx.coordination.remove_node(node_id).await? {
                warn!(leader = %self.ctx.node_id, %node_id, "removed dead node");
            }
        }

        let members = assignment_members(views);
        if members.is_empty() {
            return Ok(());
        }

        let shard_count = self.ctx.config.limits.shard_count;
        let current = self.ctx.coordination.assignment().await?;
        if !needs_publish(current.as_ref(), lease.epoch, &members, shard_count) {
            return Ok(());
        }

        let version = current.as_ref().map(|a| a.version).unwrap_or(0) + 1;
        let next = ShardAssignment::round_robin(lease.epoch, version, shard_count, &members);
        match self
            .ctx
            .coordination
            .publish_assignment(&self.ctx.node_id, next)
            .await
        {
            Ok(()) => {
                info!(
                    leader = %self.ctx.node_id,
                    epoch = lease.epoch,
                    version,
                    members = ?members,
                    "published shard assignment"
                );
                Ok(())
            }
            Err(e @ (StoreError::NotLeader(_) | StoreError::StaleAssignment { .. })) => {
                debug!(leader = %self.ctx.node_id, error = %e, "assignment publish lost a race");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_owned_shards(&self) -> Result<(), StoreError> {
        let owned = match self.ctx.coordination.assignment().await? {
            Some(assignment) => ShardFilter::Only(assignment.shards_of(&self.ctx.node_id)),
            None => ShardFilter::none(),
        };

        let changed = self.signals.owned_shards.send_if_modified(|current| {
            if *current == owned {
                return false;
            }
            *current = owned.clone();
            true
        });
        if changed {
            let count = match &owned {
                ShardFilter::Only(set) => set.len(),
                ShardFilter::All => self.ctx.config.limits.shard_count as usize,
            };
            info!(node_id = %self.ctx.node_id, shards = count, "shard ownership changed");
        }
        Ok(())
    }
}

pub(crate) async fn heartbeat_loop(mut membership: Membership, mut shutdown: watch::Receiver<bool>) {
    let node_id = membership.ctx.node_id.clone();
    info!(%node_id, interval = ?membership.ctx.config.heartbeat_interval(), "heartbeat loop started");

    // the first tick fires immediately so the node shows up as Joining; later
    // ticks keep the period fixed however long each write takes
    let interval = membership.ctx.config.heartbeat_interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delay = membership.heartbeat_once().await;
                if delay < interval {
                    ticker.reset_after(delay);
                }
            }
            _ = shutdown.changed() => {
                info!(%node_id, "heartbeat loop shutting down");
                break;
            }
        }
    }
}

pub(crate) async fn coordination_loop(
    mut membership: Membership,
    mut shutdown: watch::Receiver<bool>,
) {
    let node_id = membership.ctx.node_id.clone();
    let interval = membership.ctx.config.heartbeat_interval();
    let backoff = membership.ctx.config.store_backoff();
    let mut failures = 0u32;
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if *membership.signals.partitioned.borrow() {
                    delay = interval;
                    continue;
                }
                match membership.coordinate_once().await {
                    Ok(()) => {
                        failures = 0;
                        delay = interval;
                    }
                    Err(e) => {
                        failures += 1;
                        delay = backoff.next_delay(failures).min(interval);
                        warn!(%node_id, error = %e, failures, "coordination round failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!(%node_id, "coordination loop shutting down");
                break;
            }
        }
    }

    if membership.leader_epoch.is_some()
        && let Err(e) = membership.ctx.coordination.release_leadership(&node_id).await
    {
        debug!(%node_id, error = %e, "could not release leadership on shutdown");
    }
}
