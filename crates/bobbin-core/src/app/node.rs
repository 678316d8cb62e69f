//! Node - a built node and its running loops.
//!
//! `Node::start` spawns, per node:
//! - heartbeat loop and coordination loop (membership)
//! - scheduler loop
//! - reaper loop
//! - executor dispatcher, which owns the execution units
//!
//! They talk through the channels in [`NodeSignals`] plus two mpsc queues
//! (claimed work, local cancels).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{SubmitDefaults, TaskClient};
use super::config::NodeConfig;
use super::context::{NodeContext, NodeSignals};
use super::control::ControlPlane;
use super::executor::dispatcher_loop;
use super::membership::{Membership, coordination_loop, heartbeat_loop};
use super::reaper_loop::{Reaper, reaper_loop};
use super::scheduler::{Scheduler, scheduler_loop};
use crate::domain::{NodeId, ShardFilter, TaskId};

const CANCEL_QUEUE_DEPTH: usize = 64;

/// A validated node that has not started yet.
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub(crate) fn new(ctx: NodeContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// A submission client backed by this node's stores.
    pub fn client(&self) -> TaskClient {
        client_for(&self.ctx, None)
    }

    pub fn control(&self) -> ControlPlane {
        control_for(&self.ctx)
    }

    /// Spawn every loop. Must be called inside a tokio runtime.
    pub fn start(self) -> NodeHandle {
        let ctx = self.ctx;
        let signals = Arc::new(NodeSignals::new());
        let (work_tx, work_rx) = mpsc::channel(ctx.config.capacity as usize);
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_QUEUE_DEPTH);

        let shutdown = || signals.shutdown.subscribe();
        let loops = vec![
            tokio::spawn(heartbeat_loop(
                Membership::new(Arc::clone(&ctx), Arc::clone(&signals)),
                shutdown(),
            )),
            tokio::spawn(coordination_loop(
                Membership::new(Arc::clone(&ctx), Arc::clone(&signals)),
                shutdown(),
            )),
            tokio::spawn(scheduler_loop(
                Scheduler::new(Arc::clone(&ctx), Arc::clone(&signals), work_tx),
                shutdown(),
            )),
            tokio::spawn(reaper_loop(
                Reaper::new(Arc::clone(&ctx), Arc::clone(&signals)),
                shutdown(),
            )),
            tokio::spawn(dispatcher_loop(Arc::clone(&ctx), work_rx, cancel_rx)),
        ];
        info!(
            node_id = %ctx.node_id,
            capacity = ctx.config.capacity,
            "node started"
        );

        NodeHandle {
            client: client_for(&ctx, Some(cancel_tx)),
            ctx,
            signals,
            loops,
        }
    }
}

fn client_for(ctx: &NodeContext, local_cancel: Option<mpsc::Sender<TaskId>>) -> TaskClient {
    TaskClient::new(
        ctx.queue.clone(),
        SubmitDefaults {
            priority: ctx.config.default_priority,
            max_attempts: ctx.config.default_max_attempts,
        },
        ctx.config.claim_interval(),
        local_cancel,
    )
}

fn control_for(ctx: &NodeContext) -> ControlPlane {
    ControlPlane::new(
        Arc::clone(&ctx.coordination),
        Arc::clone(&ctx.clock),
        ctx.config.heartbeat_interval(),
        ctx.config.dead_after(),
    )
}

/// Running node.
/// - `shutdown()` で新規 claim を止め、実行中タスクの完了を待つ
/// - `kill()` はクラッシュ相当: 全ループと実行中タスクを即座に中断
///
/// Dropping the handle leaves the node running in the background.
pub struct NodeHandle {
    ctx: Arc<NodeContext>,
    signals: Arc<NodeSignals>,
    client: TaskClient,
    loops: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    /// Client whose cancels also reach this node's executor directly.
    pub fn client(&self) -> TaskClient {
        self.client.clone()
    }

    pub fn control(&self) -> ControlPlane {
        control_for(&self.ctx)
    }

    /// Tasks currently holding an execution slot.
    pub fn in_flight(&self) -> u32 {
        self.ctx.in_flight()
    }

    pub fn owned_shards(&self) -> ShardFilter {
        self.signals.owned_shards.borrow().clone()
    }

    pub fn is_partitioned(&self) -> bool {
        *self.signals.partitioned.borrow()
    }

    pub fn is_draining(&self) -> bool {
        *self.signals.draining.borrow()
    }

    /// Graceful stop: no new claims, in-flight tasks run to the end, then
    /// the node leaves the membership so its shards move without waiting for
    /// the dead timeout.
    pub async fn shutdown(self) {
        let node_id = self.ctx.node_id.clone();
        info!(%node_id, in_flight = self.in_flight(), "shutting down");
        // ignore: every receiver may already be gone
        let _ = self.signals.shutdown.send(true);

        for join in self.loops {
            if let Err(e) = join.await {
                warn!(%node_id, error = %e, "node loop ended abnormally");
            }
        }

        match self.ctx.coordination.remove_node(&node_id).await {
            Ok(_) => debug!(%node_id, "left the membership"),
            Err(e) => warn!(%node_id, error = %e, "could not leave the membership"),
        }
        info!(%node_id, "node stopped");
    }

    /// Crash stop. Leases held by this node are left to expire and be
    /// recovered by whichever node owns their shards.
    pub fn kill(self) {
        warn!(node_id = %self.ctx.node_id, in_flight = self.in_flight(), "killing node");
        for join in &self.loops {
            join.abort();
        }
    }
}
