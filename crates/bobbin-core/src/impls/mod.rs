//! Impls - 実装（開発用・テスト用）
//!
//! In-memory implementations of the store ports. Both can be cloned and
//! shared across every node of an in-process cluster.
//!
//! # 本番用実装
//! A replicated store with per-key compare-and-set belongs in its own crate
//! implementing `TaskStore` and `CoordinationStore`.

pub mod inmem_coordination;
pub mod inmem_task_store;

pub use self::inmem_coordination::InMemoryCoordinationStore;
pub use self::inmem_task_store::InMemoryTaskStore;
