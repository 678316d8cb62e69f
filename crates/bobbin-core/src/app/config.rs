//! NodeConfig - per-node tuning.
//!
//! Durations are stored as milliseconds so the struct reads naturally from
//! TOML; the accessors hand out `Duration`s. Everything has a default, and
//! `validate` runs before a node is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::NodeId;
use crate::queue::{RetryPolicy, SubmitLimits};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Concurrent execution slots.
    pub capacity: u32,

    pub heartbeat_interval_ms: u64,
    /// A node silent for `dead_after_multiple × heartbeat_interval` is dead.
    pub dead_after_multiple: u32,

    pub lease_duration_ms: u64,
    /// Subtracted from the lease to get the default execution timeout.
    pub lease_safety_margin_ms: u64,
    /// Defaults to `lease_duration - lease_safety_margin`.
    pub execution_timeout_ms: Option<u64>,
    /// Defaults to a third of the lease. Must stay below half of it.
    pub renew_interval_ms: Option<u64>,

    pub claim_interval_ms: u64,
    /// Defaults to the lease duration.
    pub sweep_interval_ms: Option<u64>,

    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,

    /// Backoff for the node's own loops when the store is unreachable.
    pub store_backoff_base_ms: u64,
    pub store_backoff_max_ms: u64,

    pub default_priority: i32,
    pub default_max_attempts: u32,

    pub limits: SubmitLimits,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            capacity: 4,
            heartbeat_interval_ms: 2_000,
            dead_after_multiple: 3,
            lease_duration_ms: 30_000,
            lease_safety_margin_ms: 5_000,
            execution_timeout_ms: None,
            renew_interval_ms: None,
            claim_interval_ms: 200,
            sweep_interval_ms: None,
            retry_base_delay_ms: 1_000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 60_000,
            store_backoff_base_ms: 100,
            store_backoff_max_ms: 2_000,
            default_priority: 0,
            default_max_attempts: 3,
            limits: SubmitLimits::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self
    }

    pub fn with_dead_after_multiple(mut self, multiple: u32) -> Self {
        self.dead_after_multiple = multiple;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = millis(lease);
        self
    }

    pub fn with_lease_safety_margin(mut self, margin: Duration) -> Self {
        self.lease_safety_margin_ms = millis(margin);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval_ms = Some(millis(interval));
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval_ms = millis(interval);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = Some(millis(interval));
        self
    }

    pub fn with_retry_policy(mut self, policy: &RetryPolicy) -> Self {
        self.retry_base_delay_ms = millis(policy.base_delay);
        self.retry_multiplier = policy.multiplier;
        self.retry_max_delay_ms = millis(policy.max_delay);
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.limits.shard_count = shard_count;
        self
    }

    pub fn with_limits(mut self, limits: SubmitLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a node counts as dead. Also the leader-lock ttl
    /// and the partition threshold.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval() * self.dead_after_multiple
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        match self.execution_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(
                self.lease_duration_ms
                    .saturating_sub(self.lease_safety_margin_ms),
            ),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        match self.renew_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.lease_duration() / 3,
        }
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lease_duration())
    }

    /// Backoff between task retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
        )
        .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    /// Backoff for transient store errors inside the node loops.
    pub fn store_backoff(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.store_backoff_base_ms), 2.0)
            .with_max_delay(Duration::from_millis(self.store_backoff_max_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("node_id", "must not be empty"));
        }
        if self.capacity == 0 {
            return Err(invalid("capacity", "must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", "must be positive"));
        }
        if self.dead_after_multiple < 2 {
            return Err(invalid(
                "dead_after_multiple",
                "must be at least 2 so a single missed heartbeat is only a suspicion",
            ));
        }
        if self.lease_duration_ms <= self.lease_safety_margin_ms {
            return Err(invalid(
                "lease_safety_margin_ms",
                format!(
                    "{} must be below lease_duration_ms {}",
                    self.lease_safety_margin_ms, self.lease_duration_ms
                ),
            ));
        }
        if self.execution_timeout().is_zero() {
            return Err(invalid("execution_timeout_ms", "must be positive"));
        }
        let renew = self.renew_interval();
        if renew.is_zero() || renew >= self.lease_duration() / 2 {
            return Err(invalid(
                "renew_interval_ms",
                format!(
                    "{renew:?} must be positive and below half the lease ({:?})",
                    self.lease_duration() / 2
                ),
            ));
        }
        if self.claim_interval_ms == 0 {
            return Err(invalid("claim_interval_ms", "must be positive"));
        }
        if self.sweep_interval().is_zero() {
            return Err(invalid("sweep_interval_ms", "must be positive"));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(invalid("retry_multiplier", "must be a finite number >= 1.0"));
        }
        if self.store_backoff_base_ms == 0 || self.store_backoff_max_ms < self.store_backoff_base_ms {
            return Err(invalid(
                "store_backoff_max_ms",
                "backoff must be positive with max >= base",
            ));
        }

        let limits = &self.limits;
        if limits.shard_count == 0 {
            return Err(invalid("limits.shard_count", "must be at least 1"));
        }
        if limits.min_priority > limits.max_priority {
            return Err(invalid("limits.min_priority", "must not exceed max_priority"));
        }
        if limits.max_attempts_ceiling == 0 {
            return Err(invalid("limits.max_attempts_ceiling", "must be at least 1"));
        }
        if !(limits.min_priority..=limits.max_priority).contains(&self.default_priority) {
            return Err(invalid("default_priority", "outside the priority range"));
        }
        if self.default_max_attempts == 0 || self.default_max_attempts > limits.max_attempts_ceiling {
            return Err(invalid(
                "default_max_attempts",
                format!("must be in [1, {}]", limits.max_attempts_ceiling),
            ));
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
