//! Domain model (ids, envelopes, leases, shards, nodes, errors).

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod lease;
pub mod node;
pub mod shard;
pub mod state;
pub mod task_type;

pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::TaskEnvelope;
pub use errors::{BobbinError, ErrorKind, FailureKind, HandlerError, TaskFailure};
pub use ids::{NodeId, TaskId};
pub use lease::{LeaderLease, Lease};
pub use node::{NodeRecord, NodeView};
pub use shard::{ShardAssignment, ShardFilter, ShardId, shard_for};
pub use state::{NodeState, TaskStatus};
pub use task_type::TaskType;
