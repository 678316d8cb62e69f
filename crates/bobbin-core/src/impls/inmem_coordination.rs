//! InMemoryCoordinationStore - 開発用・テスト用の CoordinationStore
//!
//! Node records, the leader lock and the shard assignment live behind one
//! mutex. Leader-lock expiry is judged against the injected clock, the way a
//! real store would judge its own TTLs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{LeaderLease, NodeId, NodeRecord, ShardAssignment};
use crate::ports::{Clock, CoordinationStore, StoreError, deadline_after};

#[derive(Default)]
struct CoordinationState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    leader: Option<LeaderLease>,
    /// Last epoch ever handed out. Survives lock expiry so epochs never repeat.
    last_epoch: u64,
    assignment: Option<ShardAssignment>,
}

#[derive(Clone)]
pub struct InMemoryCoordinationStore {
    state: Arc<Mutex<CoordinationState>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCoordinationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinationState::default())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn heartbeat(&self, mut record: NodeRecord) -> Result<NodeRecord, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.nodes.get(&record.node_id) {
            Some(existing) => {
                record.heartbeat_seq = existing.heartbeat_seq + 1;
                record.first_seen = existing.first_seen;
                record.draining = existing.draining;
            }
            None => {
                record.heartbeat_seq = 1;
                record.first_seen = record.last_heartbeat;
                record.draining = false;
            }
        }
        state.nodes.insert(record.node_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_node(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.nodes.get(node_id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.nodes.values().cloned().collect())
    }

    async fn remove_node(&self, node_id: &NodeId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.nodes.remove(node_id).is_some())
    }

    async fn set_draining(&self, node_id: &NodeId, draining: bool) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(node_id) {
            Some(record) => {
                record.draining = draining;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_leadership(
        &self,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<Option<LeaderLease>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = deadline_after(now, ttl);
        let mut state = self.state.lock().await;

        let epoch = match &state.leader {
            Some(lease) if !lease.is_expired(now) && &lease.holder != node_id => return Ok(None),
            Some(lease) if !lease.is_expired(now) => lease.epoch,
            _ => state.last_epoch + 1,
        };

        state.last_epoch = epoch;
        let lease = LeaderLease {
            holder: node_id.clone(),
            epoch,
            expires_at,
        };
        state.leader = Some(lease.clone());
        Ok(Some(lease))
    }

    async fn release_leadership(&self, node_id: &NodeId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.leader.as_ref().is_some_and(|l| &l.holder == node_id) {
            state.leader = None;
        }
        Ok(())
    }

    async fn leader(&self) -> Result<Option<LeaderLease>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .leader
            .clone()
            .filter(|l| !l.is_expired(now)))
    }

    async fn assignment(&self) -> Result<Option<ShardAssignment>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.assignment.clone())
    }

    async fn publish_assignment(
        &self,
        publisher: &NodeId,
        assignment: ShardAssignment,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let holds_lock = state.leader.as_ref().is_some_and(|l| {
            &l.holder == publisher && l.epoch == assignment.epoch && !l.is_expired(now)
        });
        if !holds_lock {
            return Err(StoreError::NotLeader(publisher.clone()));
        }

        let stored = state.assignment.as_ref().map(|a| a.version).unwrap_or(0);
        if assignment.version <= stored {
            return Err(StoreError::StaleAssignment {
                stored,
                offered: assignment.version,
            });
        }

        state.assignment = Some(assignment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn setup() -> (ManualClock, InMemoryCoordinationStore) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryCoordinationStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn heartbeat_bumps_seq_and_keeps_drain_flag() {
        let (clock, store) = setup();
        let a = NodeId::new("a");

        let first = store
            .heartbeat(NodeRecord::heartbeat(a.clone(), 4, 0, clock.now()))
            .await
            .unwrap();
        assert_eq!(first.heartbeat_seq, 1);

        assert!(store.set_draining(&a, true).await.unwrap());
        clock.advance(Duration::from_secs(2));

        let second = store
            .heartbeat(NodeRecord::heartbeat(a.clone(), 4, 1, clock.now()))
            .await
            .unwrap();
        assert_eq!(second.heartbeat_seq, 2);
        assert!(second.draining);
        assert_eq!(second.first_seen, first.first_seen);
        assert!(!store.set_draining(&NodeId::new("ghost"), true).await.unwrap());
    }

    #[tokio::test]
    async fn leader_lock_is_exclusive_until_expiry() {
        let (clock, store) = setup();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let ttl = Duration::from_secs(6);

        let lease = store.acquire_leadership(&a, ttl).await.unwrap().unwrap();
        assert_eq!(lease.epoch, 1);
        assert!(store.acquire_leadership(&b, ttl).await.unwrap().is_none());

        // renewal keeps the epoch
        clock.advance(Duration::from_secs(3));
        let renewed = store.acquire_leadership(&a, ttl).await.unwrap().unwrap();
        assert_eq!(renewed.epoch, 1);

        clock.advance(Duration::from_secs(6));
        let taken = store.acquire_leadership(&b, ttl).await.unwrap().unwrap();
        assert_eq!(taken.holder, b);
        assert_eq!(taken.epoch, 2);
    }

    #[tokio::test]
    async fn publish_requires_current_epoch_and_newer_version() {
        let (clock, store) = setup();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let ttl = Duration::from_secs(6);

        let lease = store.acquire_leadership(&a, ttl).await.unwrap().unwrap();
        let v1 = ShardAssignment::round_robin(lease.epoch, 1, 4, &[a.clone()]);
        store.publish_assignment(&a, v1.clone()).await.unwrap();

        let err = store.publish_assignment(&a, v1).await.unwrap_err();
        assert_eq!(err, StoreError::StaleAssignment { stored: 1, offered: 1 });

        let err = store
            .publish_assignment(&b, ShardAssignment::round_robin(lease.epoch, 2, 4, &[b.clone()]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotLeader(b.clone()));

        // a deposed leader cannot publish under its old epoch
        clock.advance(ttl);
        store.acquire_leadership(&b, ttl).await.unwrap().unwrap();
        let err = store
            .publish_assignment(&a, ShardAssignment::round_robin(lease.epoch, 3, 4, &[a.clone()]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotLeader(a));
    }
}
