//! Exponential backoff used when a [`RetryToken`](crate::remote::RetryToken)
//! doesn't specify its own delay.
//!
//! Lifted straight from this crate's retry policy, generalised from
//! HTTP-status/curl-error classification (the remote object now does that
//! itself through `RetryToken::is_retryable`) down to a pure
//! attempt-number-to-delay function.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, or `None` once `attempt` (1-based)
    /// has exhausted the retry budget.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let raw = self.base_delay.saturating_mul(exp);
        Some(raw.min(self.max_delay))
    }
}
