//! Queue module: admission, lease-gated transitions, recovery and retry
//! backoff, all built on the `TaskStore` compare-and-set.

mod recovery;
mod retry;
mod task_queue;

pub use recovery::{RecoveryOutcome, SweepReport};
pub use retry::RetryPolicy;
pub use task_queue::{LeaseState, SubmitLimits, TaskQueue};
