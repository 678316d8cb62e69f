//! NodeBuilder - ノードの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::config::{ConfigError, NodeConfig};
use super::context::NodeContext;
use super::node::Node;
use crate::domain::{DefaultDecider, TaskType};
use crate::ports::{Clock, CoordinationStore, SystemClock, TaskStore, UlidGenerator};
use crate::queue::TaskQueue;
use crate::typed::{DynHandler, Handler, RegistryError, Task, TypedRegistry};

/// NodeBuilder はノードを構築
///
/// # 使用例
/// ```ignore
/// let node = NodeBuilder::new(NodeConfig::new("node-a"))
///     .task_store(tasks)
///     .coordination_store(coordination)
///     .register::<Resize, _>(ResizeHandler)?
///     .expect_tasks(&["media.image.resize.v1"])
///     .build()?;
/// let handle = node.start();
/// ```
///
/// # Fail-fast 設計
/// - config は build() 時に検証される
/// - 両方の store が必須
/// - expect_tasks() の集合 ⊆ 登録済み集合 でなければ BuildError
pub struct NodeBuilder {
    config: NodeConfig,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<TaskType>>,
    task_store: Option<Arc<dyn TaskStore>>,
    coordination_store: Option<Arc<dyn CoordinationStore>>,
    clock: Option<Arc<dyn Clock>>,
}

/// BuildError はノード構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<TaskType>),

    #[error("no {0} configured")]
    MissingStore(&'static str),
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            registry: TypedRegistry::new(),
            expected_tasks: None,
            task_store: None,
            coordination_store: None,
            clock: None,
        }
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn coordination_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.coordination_store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Handler を登録
    ///
    /// # Example
    /// ```ignore
    /// builder.register::<MyTask, _>(MyTaskHandler)?;
    /// ```
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Raw JSON handler を登録
    pub fn register_dyn(mut self, handler: Arc<dyn DynHandler>) -> Result<Self, RegistryError> {
        self.registry.register_dyn(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|&t| TaskType::new(t)).collect());
        self
    }

    /// 検証してから Node を生成
    ///
    /// # 検証
    /// - NodeConfig::validate()
    /// - task store / coordination store が設定されているか
    /// - expect_tasks() の task_type が全て登録されているか
    pub fn build(self) -> Result<Node, BuildError> {
        self.config.validate()?;

        let task_store = self.task_store.ok_or(BuildError::MissingStore("task store"))?;
        let coordination = self
            .coordination_store
            .ok_or(BuildError::MissingStore("coordination store"))?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<TaskType> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let queue = TaskQueue::new(
            task_store,
            Arc::clone(&clock),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            Arc::new(DefaultDecider::new(self.config.retry_policy())),
            self.config.limits.clone(),
        );

        Ok(Node::new(NodeContext::new(
            self.config,
            queue,
            coordination,
            Arc::new(self.registry),
            clock,
        )))
    }
}
