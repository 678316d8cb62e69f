//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::task::Task;
use crate::domain::{HandlerError, NodeId, TaskId};

/// Attempt metadata handed to a handler alongside its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub node_id: NodeId,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TaskContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handler は Task を実行して結果を返す
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, task: Resize, ctx: TaskContext) -> Result<String, HandlerError> {
///         Ok(format!("{} resized on attempt {}", task.image, ctx.attempt))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<Resize>` は `Resize` しか受け取れない
/// - コンパイル時に Task と Handler の対応が保証される
///
/// Execution is at-least-once: a handler may run again for the same task
/// after a lease expiry, so side effects should be idempotent.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: TaskContext) -> Result<T::Output, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T> を DynHandler に変換することで、
/// HashMap<TaskType, Arc<dyn DynHandler>> に格納可能にします。
///
/// Raw JSON handlers can implement this directly.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, HandlerError>;

    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        // a payload that does not decode will not decode on a retry either
        let task: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::permanent(format!("payload decode: {e}")))?;
        let output = self.handler.handle(task, ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| HandlerError::permanent(format!("result encode: {e}")))
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Add {
        pub a: i64,
        pub b: i64,
    }

    impl Task for Add {
        const TYPE: &'static str = "test.math.add.v1";
        type Output = i64;
    }

    pub struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, task: Add, _ctx: TaskContext) -> Result<i64, HandlerError> {
            Ok(task.a + task.b)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Greet {
        pub name: String,
    }

    impl Task for Greet {
        const TYPE: &'static str = "test.greet.v1";
        type Output = String;
    }

    pub struct GreetHandler;

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn handle(&self, task: Greet, _ctx: TaskContext) -> Result<String, HandlerError> {
            if task.name.is_empty() {
                return Err(HandlerError::permanent("empty name"));
            }
            Ok(format!("hello {}", task.name))
        }
    }

    pub fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            node_id: NodeId::new("test-node"),
            attempt: 1,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn typed_handler_decodes_payload_and_encodes_result() {
        let typed_handler = TypedHandler::<Add, _>::new(AddHandler);

        let out = typed_handler
            .handle_dyn(json!({ "a": 40, "b": 2 }), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(typed_handler.task_type(), "test.math.add.v1");
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let typed_handler = TypedHandler::<Add, _>::new(AddHandler);

        let err = typed_handler
            .handle_dyn(json!({ "a": "forty" }), ctx())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn last_attempt() {
        let mut c = ctx();
        assert!(!c.is_last_attempt());
        c.attempt = 3;
        assert!(c.is_last_attempt());
    }
}
