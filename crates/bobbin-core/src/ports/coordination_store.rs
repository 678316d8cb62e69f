//! CoordinationStore port - membership records, leader lock, shard assignment.
//!
//! Lives in the same external store as the tasks. Every write is a per-key
//! atomic operation; nothing here assumes a consensus implementation.

use std::time::Duration;

use async_trait::async_trait;

use super::StoreError;
use crate::domain::{LeaderLease, NodeId, NodeRecord, ShardAssignment};

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Upsert a heartbeat.
    ///
    /// The store bumps `heartbeat_seq` and keeps `first_seen` and `draining`
    /// from the existing record, so a heartbeat never undoes a drain.
    async fn heartbeat(&self, record: NodeRecord) -> Result<NodeRecord, StoreError>;

    async fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError>;

    async fn remove_node(&self, node_id: &NodeId) -> Result<bool, StoreError>;

    /// Returns false when the node is unknown.
    async fn set_draining(&self, node_id: &NodeId, draining: bool) -> Result<bool, StoreError>;

    /// Take the leader lock if it is free or expired, or extend it if
    /// `node_id` already holds it. Returns `None` while someone else holds a
    /// valid lock. The epoch increments whenever the holder changes.
    async fn acquire_leadership(
        &self,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, StoreError>;

    /// Give the lock up early. No-op unless `node_id` holds it.
    async fn release_leadership(&self, node_id: &NodeId) -> Result<(), StoreError>;

    async fn leader(&self) -> Result<Option<LeaderLease>, StoreError>;

    async fn assignment(&self) -> Result<Option<ShardAssignment>, StoreError>;

    /// Publish a new assignment.
    ///
    /// Accepted only if `publisher` holds a valid leader lock whose epoch
    /// equals `assignment.epoch`, and `assignment.version` is newer than the
    /// stored one.
    async fn publish_assignment(
        &self,
        publisher: &NodeId,
        assignment: ShardAssignment,
    ) -> Result<(), StoreError>;
}
