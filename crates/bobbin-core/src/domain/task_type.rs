//! TaskType - the tag that selects a handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task type tag.
///
/// # Naming convention
/// - `{namespace}.{domain}.{action}.v{major}`
/// - e.g. `acme.billing.charge.v1`
///
/// Only emptiness and whitespace are enforced (see [`TaskType::validate`]);
/// the convention itself is advisory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a reason when the tag is unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("task type must not be empty".to_string());
        }
        if self.0.chars().any(char::is_whitespace) {
            return Err(format!("task type '{}' must not contain whitespace", self.0));
        }
        Ok(())
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::conventional("acme.billing.charge.v1")]
    #[case::short("echo")]
    fn accepts_usable_tags(#[case] tag: &str) {
        assert!(TaskType::new(tag).validate().is_ok());
    }

    #[rstest]
    #[case::empty("")]
    #[case::space("acme billing")]
    #[case::newline("acme\n")]
    fn rejects_unusable_tags(#[case] tag: &str) {
        assert!(TaskType::new(tag).validate().is_err());
    }
}
