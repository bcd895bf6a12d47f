//! Retry budgets and exponential backoff for classification calls.

use std::time::Duration;

use linetag_classifier::ClassifyError;
use linetag_shared::BatchConfig;

/// Explicit retry policy consumed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after retryable backend errors (timeouts included).
    pub max_retries: u32,
    /// Extra attempts after malformed responses.
    pub format_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

impl From<&BatchConfig> for RetryPolicy {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            format_retries: config.format_retries,
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts.
    pub fn immediate(max_retries: u32, format_retries: u32) -> Self {
        Self {
            max_retries,
            format_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Fresh per-chunk budget tracker.
    pub fn tracker(&self) -> RetryTracker {
        RetryTracker {
            policy: *self,
            backend_failures: 0,
            format_failures: 0,
        }
    }
}

/// Per-chunk failure counters against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    backend_failures: u32,
    format_failures: u32,
}

impl RetryTracker {
    /// Count a failure; returns whether another attempt is allowed.
    pub fn should_retry(&mut self, error: &ClassifyError) -> bool {
        match error {
            ClassifyError::ResponseFormat(_) => {
                self.format_failures += 1;
                self.format_failures <= self.policy.format_retries
            }
            e if e.is_retryable_backend() => {
                self.backend_failures += 1;
                self.backend_failures <= self.policy.max_retries
            }
            _ => false,
        }
    }
}
