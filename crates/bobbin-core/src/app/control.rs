//! ControlPlane - node control surface for operational tooling.
//!
//! Every node can serve it; reads and writes go straight to the
//! coordination store. A drain takes effect on the target node at its next
//! heartbeat, and its shards move at the leader's next round.

use std::sync::Arc;

use tracing::info;

use crate::domain::{BobbinError, LeaderLease, NodeId, NodeView, ShardAssignment};
use crate::ports::{Clock, CoordinationStore};

#[derive(Clone)]
pub struct ControlPlane {
    coordination: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: std::time::Duration,
    dead_after: std::time::Duration,
}

impl ControlPlane {
    pub(crate) fn new(
        coordination: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        heartbeat_interval: std::time::Duration,
        dead_after: std::time::Duration,
    ) -> Self {
        Self {
            coordination,
            clock,
            heartbeat_interval,
            dead_after,
        }
    }

    /// Every known node with its classified state, sorted by node id.
    pub async fn list_nodes(&self) -> Result<Vec<NodeView>, BobbinError> {
        let now = self.clock.now();
        let mut views: Vec<NodeView> = self
            .coordination
            .list_nodes()
            .await?
            .into_iter()
            .map(|record| {
                let state = record.classify(now, self.heartbeat_interval, self.dead_after);
                NodeView { record, state }
            })
            .collect();
        views.sort_by(|a, b| a.record.node_id.cmp(&b.record.node_id));
        Ok(views)
    }

    /// Stop the node from claiming new work. In-flight tasks finish.
    ///
    /// Returns false when the node is unknown.
    pub async fn drain_node(&self, node_id: &NodeId) -> Result<bool, BobbinError> {
        let found = self.coordination.set_draining(node_id, true).await?;
        if found {
            info!(%node_id, "drain requested");
        }
        Ok(found)
    }

    /// Undo a drain.
    pub async fn resume_node(&self, node_id: &NodeId) -> Result<bool, BobbinError> {
        let found = self.coordination.set_draining(node_id, false).await?;
        if found {
            info!(%node_id, "resume requested");
        }
        Ok(found)
    }

    /// The current leader lock, if it has not expired.
    pub async fn leader(&self) -> Result<Option<LeaderLease>, BobbinError> {
        let now = self.clock.now();
        Ok(self
            .coordination
            .leader()
            .await?
            .filter(|lease| !lease.is_expired(now)))
    }

    pub async fn assignment(&self) -> Result<Option<ShardAssignment>, BobbinError> {
        Ok(self.coordination.assignment().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeRecord, NodeState};
    use crate::impls::InMemoryCoordinationStore;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn control() -> (ControlPlane, InMemoryCoordinationStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryCoordinationStore::new(Arc::new(clock.clone()));
        let control = ControlPlane::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Duration::from_secs(2),
            Duration::from_secs(6),
        );
        (control, store, clock)
    }

    async fn beat(store: &InMemoryCoordinationStore, clock: &ManualClock, name: &str) {
        store
            .heartbeat(NodeRecord::heartbeat(NodeId::new(name), 4, 1, clock.now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lists_nodes_sorted_with_their_state() {
        let (control, store, clock) = control();
        beat(&store, &clock, "b").await;
        beat(&store, &clock, "a").await;
        beat(&store, &clock, "a").await;
        clock.advance(Duration::from_millis(3_500));
        beat(&store, &clock, "c").await;

        let nodes = control.list_nodes().await.unwrap();
        let summary: Vec<(&str, NodeState)> = nodes
            .iter()
            .map(|v| (v.record.node_id.as_str(), v.state))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", NodeState::Suspected),
                ("b", NodeState::Suspected),
                ("c", NodeState::Joining),
            ]
        );
    }

    #[tokio::test]
    async fn drain_and_resume_flip_the_flag() {
        let (control, store, clock) = control();
        beat(&store, &clock, "a").await;

        assert!(control.drain_node(&NodeId::new("a")).await.unwrap());
        assert!(control.list_nodes().await.unwrap()[0].record.draining);

        // a heartbeat does not undo a drain
        beat(&store, &clock, "a").await;
        assert!(control.list_nodes().await.unwrap()[0].record.draining);

        assert!(control.resume_node(&NodeId::new("a")).await.unwrap());
        assert!(!control.list_nodes().await.unwrap()[0].record.draining);

        assert!(!control.drain_node(&NodeId::new("ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn expired_leader_is_not_reported() {
        let (control, store, clock) = control();
        store
            .acquire_leadership(&NodeId::new("a"), Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(control.leader().await.unwrap().unwrap().holder, NodeId::new("a"));

        clock.advance(Duration::from_secs(6));
        assert_eq!(control.leader().await.unwrap(), None);
    }
}
