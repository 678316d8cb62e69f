//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff.
///
/// Used twice: between task retries (handler failures, timeouts) and between
/// local retries of transient store errors in the node loops.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// No backoff at all.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }

    /// Delay before the next try, given the number of tries already made
    /// (1-indexed).
    ///
    /// `delay = base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0);

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy =
            RetryPolicy::new(Duration::from_secs(2), 2.0).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.next_delay(3), Duration::from_secs(5));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn immediate_policy_never_waits() {
        assert_eq!(RetryPolicy::immediate().next_delay(7), Duration::ZERO);
    }
}
