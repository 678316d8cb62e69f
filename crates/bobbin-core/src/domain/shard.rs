//! Shards: deterministic partitions of the task space.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::ids::{NodeId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Map a task to its shard.
///
/// The shard is computed once at insert and stored on the envelope, so only
/// the inserting node needs to agree with itself.
pub fn shard_for(task_id: &TaskId, shard_count: u32) -> ShardId {
    let mut hasher = DefaultHasher::new();
    task_id.as_ulid().0.hash(&mut hasher);
    ShardId((hasher.finish() % u64::from(shard_count.max(1))) as u32)
}

/// Which shards a query should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardFilter {
    All,
    Only(BTreeSet<ShardId>),
}

impl ShardFilter {
    /// Matches nothing.
    pub fn none() -> Self {
        ShardFilter::Only(BTreeSet::new())
    }

    pub fn matches(&self, shard: ShardId) -> bool {
        match self {
            ShardFilter::All => true,
            ShardFilter::Only(set) => set.contains(&shard),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ShardFilter::Only(set) if set.is_empty())
    }
}

/// Shard -> owner mapping published by the coordinator.
///
/// `owners[i]` owns shard `i`, so every shard has exactly one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Leader epoch under which this assignment was published.
    pub epoch: u64,
    /// Bumped on every publish.
    pub version: u64,
    pub owners: Vec<NodeId>,
}

impl ShardAssignment {
    /// Round-robin the shards over the given nodes (sorted for determinism).
    pub fn round_robin(epoch: u64, version: u64, shard_count: u32, nodes: &[NodeId]) -> Self {
        let mut sorted: Vec<NodeId> = nodes.to_vec();
        sorted.sort();
        sorted.dedup();

        let owners = if sorted.is_empty() {
            Vec::new()
        } else {
            (0..shard_count as usize)
                .map(|i| sorted[i % sorted.len()].clone())
                .collect()
        };

        Self {
            epoch,
            version,
            owners,
        }
    }

    pub fn owner_of(&self, shard: ShardId) -> Option<&NodeId> {
        self.owners.get(shard.0 as usize)
    }

    pub fn shards_of(&self, node: &NodeId) -> BTreeSet<ShardId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| *owner == node)
            .map(|(i, _)| ShardId(i as u32))
            .collect()
    }

    /// Set of nodes that own at least one shard.
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.owners.iter().cloned().collect()
    }
}
