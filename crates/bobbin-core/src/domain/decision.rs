//! Decision model: what happens to a task after an unsuccessful attempt.
//!
//! The decider is a pure function of the envelope and the failure. Carrying
//! the decision out (the compare-and-set) is the queue's job.

use std::time::Duration;

use super::envelope::TaskEnvelope;
use super::errors::TaskFailure;
use crate::queue::RetryPolicy;

/// The next action for a task whose attempt did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to Pending after `delay`.
    Retry { delay: Duration, reason: String },

    /// Terminal failure.
    MarkFailed { reason: String },
}

pub trait Decider: Send + Sync {
    /// `should_retry` is the caller's vote; a decider may still refuse when
    /// the attempt budget is spent.
    fn decide(&self, task: &TaskEnvelope, failure: &TaskFailure, should_retry: bool) -> Decision;
}

/// Attempt-budget decider with exponential backoff between retries.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskEnvelope, failure: &TaskFailure, should_retry: bool) -> Decision {
        if !task.has_attempts_left() {
            return Decision::MarkFailed {
                reason: format!(
                    "max attempts reached: {}/{} ({failure})",
                    task.attempts, task.max_attempts
                ),
            };
        }
        if !should_retry {
            return Decision::MarkFailed {
                reason: format!("not retryable ({failure})"),
            };
        }

        let delay = self.retry_policy.next_delay(task.attempts);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                task.attempts + 1,
                task.max_attempts,
                delay
            ),
        }
    }
}
