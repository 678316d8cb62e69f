//! Leases: time-bounded exclusive claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;

/// A claim binding one task to one node until `expires_at`.
///
/// Owner and expiry always travel together, so an envelope either holds a
/// whole lease or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: NodeId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: NodeId, expires_at: DateTime<Utc>) -> Self {
        Self { owner, expires_at }
    }

    /// A lease is expired at and after its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Valid (non-expired) and held by `node`.
    pub fn is_held_by(&self, node: &NodeId, now: DateTime<Utc>) -> bool {
        &self.owner == node && !self.is_expired(now)
    }
}

/// The coordinator lock. Whoever holds it may publish shard assignments.
///
/// `epoch` increments every time the holder changes, so an assignment
/// published under an older epoch is recognisably stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub holder: NodeId,
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
