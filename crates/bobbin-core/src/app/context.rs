//! Wiring shared by every loop of one node.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};

use super::config::NodeConfig;
use crate::domain::{NodeId, ShardFilter};
use crate::ports::{Clock, CoordinationStore};
use crate::queue::TaskQueue;
use crate::typed::TypedRegistry;

pub(crate) struct NodeContext {
    pub node_id: NodeId,
    pub config: NodeConfig,
    pub queue: TaskQueue,
    pub coordination: Arc<dyn CoordinationStore>,
    pub registry: Arc<TypedRegistry>,
    pub clock: Arc<dyn Clock>,
    /// One permit per execution slot. The scheduler holds a permit for every
    /// task from claim until its execution unit finishes.
    pub slots: Arc<Semaphore>,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        queue: TaskQueue,
        coordination: Arc<dyn CoordinationStore>,
        registry: Arc<TypedRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            node_id: config.node_id(),
            slots: Arc::new(Semaphore::new(config.capacity as usize)),
            config,
            queue,
            coordination,
            registry,
            clock,
        }
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> u32 {
        let free = u32::try_from(self.slots.available_permits()).unwrap_or(u32::MAX);
        self.config.capacity.saturating_sub(free)
    }
}

/// Node-local state published by one loop and read by the others.
pub(crate) struct NodeSignals {
    pub shutdown: watch::Sender<bool>,
    pub owned_shards: watch::Sender<ShardFilter>,
    pub draining: watch::Sender<bool>,
    pub partitioned: watch::Sender<bool>,
}

impl NodeSignals {
    pub fn new() -> Self {
        Self {
            shutdown: watch::channel(false).0,
            owned_shards: watch::channel(ShardFilter::none()).0,
            draining: watch::channel(false).0,
            partitioned: watch::channel(false).0,
        }
    }

    /// True while the node must not take new work.
    pub fn paused(&self) -> bool {
        *self.draining.borrow() || *self.partitioned.borrow()
    }
}
