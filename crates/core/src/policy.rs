//! Bounded retry policy shared by the dispatcher and the watchdog.

use serde::{Deserialize, Serialize};

/// How many times an operation may be reset back to `pending` before a stall
/// or failure becomes permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// A policy that fails on the first stall.
    pub fn no_retry() -> Self {
        Self { max_retries: 0 }
    }

    /// Whether an operation with the given `retry_count` may be reset again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_retry_respects_bound() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn no_retry_never_retries() {
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn default_allows_three_resets() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
    }
}
