//! bobbin-core
//!
//! Core building blocks for Bobbin, a decentralized asynchronous task
//! executor. Nodes share nothing but the store: tasks, heartbeats, the
//! leader lock and the shard assignment all live behind the store ports and
//! change only through compare-and-set.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, envelope, lease, shard, node, state, errors, decision）
//! - **ports**: 抽象化レイヤー（TaskStore, CoordinationStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryCoordinationStore など開発用）
//! - **queue**: TaskQueue（submit, claim, renew, complete, fail, cancel, recovery）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **app**: ノード（builder, membership, scheduler, executor, reaper, client, control）
//!
//! Execution is at-least-once: a handler can run again for the same task
//! after its lease expires.

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{
    BuildError, ControlPlane, Node, NodeBuilder, NodeConfig, NodeHandle, SubmitOptions,
    TaskClient, TaskOutcome, TaskStatusView,
};
pub use domain::{BobbinError, HandlerError, NodeId, TaskId, TaskStatus, TaskType};
pub use typed::{Handler, Task, TaskContext};
