//! InMemoryTaskStore - 開発用・テスト用の TaskStore
//!
//! # 学習ポイント
//! - tokio::sync::Mutex で compare-and-set を 1 つの critical section にする
//! - version は store 側で bump する（呼び出し側は期待値だけ渡す）
//! - `set_unavailable` で store 障害を注入できる

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ShardFilter, TaskEnvelope, TaskId, TaskStatus};
use crate::ports::{QueueCounts, StoreError, TaskStore};

/// 開発用の TaskStore
///
/// Clones share the same map, so every node of an in-process cluster can
/// hold its own handle to one store.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<TaskId, TaskEnvelope>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of every stored envelope (テスト用).
    pub async fn snapshot(&self) -> Vec<TaskEnvelope> {
        self.tasks.lock().await.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, mut envelope: TaskEnvelope) -> Result<TaskEnvelope, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&envelope.task_id) {
            return Err(StoreError::AlreadyExists(envelope.task_id));
        }
        envelope.version = 1;
        debug_assert!(envelope.check_invariants().is_ok());
        tasks.insert(envelope.task_id, envelope.clone());
        Ok(envelope)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskEnvelope>, StoreError> {
        self.check_available()?;
        Ok(self.tasks.lock().await.get(&task_id).cloned())
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        mut next: TaskEnvelope,
    ) -> Result<TaskEnvelope, StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.lock().await;
        let stored = tasks
            .get_mut(&next.task_id)
            .ok_or(StoreError::NotFound(next.task_id))?;

        if stored.version != expected_version {
            return Err(StoreError::VersionMismatch {
                task_id: next.task_id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        next.version = expected_version + 1;
        debug_assert!(next.check_invariants().is_ok(), "{:?}", next.check_invariants());
        *stored = next.clone();
        Ok(next)
    }

    async fn list_by_shard_and_status(
        &self,
        shards: &ShardFilter,
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskEnvelope>, StoreError> {
        self.check_available()?;
        if shards.is_empty() {
            return Ok(Vec::new());
        }
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|t| shards.matches(t.shard) && statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.check_available()?;
        let tasks = self.tasks.lock().await;
        let mut counts = QueueCounts::default();
        for task in tasks.values() {
            counts.record(task.status);
        }
        Ok(counts)
    }
}
