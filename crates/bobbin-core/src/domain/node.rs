//! Node records as persisted by heartbeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;
use super::state::NodeState;

/// What a node publishes about itself on every heartbeat.
///
/// `heartbeat_seq`, `first_seen` and `draining` are owned by the store:
/// a heartbeat write bumps the sequence and leaves the other two alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub capacity: u32,
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub heartbeat_seq: u64,
    pub draining: bool,
}

impl NodeRecord {
    /// A fresh heartbeat as written by the node itself.
    pub fn heartbeat(node_id: NodeId, capacity: u32, current_load: u32, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            capacity,
            current_load,
            last_heartbeat: now,
            first_seen: now,
            heartbeat_seq: 0,
            draining: false,
        }
    }

    pub fn available_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.current_load)
    }

    /// Classify this node as seen at `now`.
    ///
    /// Silence past one interval plus half an interval of grace is a missed
    /// heartbeat (Suspected); silence longer than `dead_after` is Dead. A node
    /// stays Joining until its second heartbeat lands.
    pub fn classify(&self, now: DateTime<Utc>, interval: Duration, dead_after: Duration) -> NodeState {
        let silence = (now - self.last_heartbeat).to_std().unwrap_or_default();
        if silence > dead_after {
            NodeState::Dead
        } else if silence > missed_after(interval) {
            NodeState::Suspected
        } else if self.heartbeat_seq <= 1 {
            NodeState::Joining
        } else {
            NodeState::Active
        }
    }
}

/// Write latency and timer jitter stretch the gap between two heartbeats past
/// the nominal interval; only a gap past this counts as a missed beat.
pub fn missed_after(interval: Duration) -> Duration {
    interval + interval / 2
}

/// A node record together with its classified state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub record: NodeRecord,
    pub state: NodeState,
}
