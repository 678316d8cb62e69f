//! Task status and node lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task status.
///
/// Transitions:
/// - Pending -> Claimed (claim, lease issued, attempt charged)
/// - Claimed -> Running (executor picked it up)
/// - Claimed | Running -> Succeeded | Failed | Cancelled
/// - Claimed | Running -> Pending (retry, or recovery after lease expiry)
/// - Pending -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether this status must carry a lease owner and expiry.
    pub fn holds_lease(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a node as seen by an observer.
///
/// - Joining: first heartbeat seen, not yet confirmed by a second one
/// - Active: heartbeating on schedule
/// - Suspected: missed one heartbeat interval, reverts on the next heartbeat
/// - Dead: silent longer than the dead timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Joining,
    Active,
    Suspected,
    Dead,
}

impl NodeState {
    /// Live nodes may own shards.
    pub fn is_live(self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}
