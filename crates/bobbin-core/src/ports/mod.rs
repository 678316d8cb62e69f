//! Ports - 抽象化レイヤー
//!
//! Each trait is the seam to a system outside the core (the durable store,
//! the wall clock, id minting). Development and test implementations live in
//! `impls`.

pub mod clock;
pub mod coordination_store;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock, deadline_after};
pub use self::coordination_store::CoordinationStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{QueueCounts, StoreError, TaskStore};
