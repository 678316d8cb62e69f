//! App - ノードのアプリケーション層
//!
//! このモジュールは、ports と queue を組み合わせてノードを動かします。
//!
//! # 主要コンポーネント
//! - **NodeBuilder**: 構築とワイヤリング（起動時検証）
//! - **Node / NodeHandle**: ループの起動・graceful shutdown・kill
//! - **Membership**: heartbeat、ノード状態、leader lock、shard 割り当て
//! - **Scheduler**: 空きスロット分だけ pending を claim
//! - **Executor**: 実行・lease 更新・timeout・cancel
//! - **ReaperLoop**: 期限切れ lease の回収
//! - **TaskClient / ControlPlane**: submitter 向け API と運用向け API

pub mod builder;
pub mod client;
pub mod config;
mod context;
pub mod control;
mod executor;
mod membership;
pub mod node;
mod reaper_loop;
mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, NodeBuilder};
pub use self::client::{SubmitOptions, TaskClient};
pub use self::config::{ConfigError, NodeConfig};
pub use self::control::ControlPlane;
pub use self::node::{Node, NodeHandle};
pub use self::status::{TaskOutcome, TaskStatusView};
