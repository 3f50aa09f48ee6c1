//! Retry policy for recoverable stage failures.
//!
//! Fatal and validation errors are never retried; recoverable errors
//! get exponential backoff with jitter, bounded by `max_attempts`.
//! A connector-supplied `retry_after_ms` hint (rate limiting) takes
//! precedence over the computed delay.

use std::time::Duration;

use rand::Rng;

use batchline_types::error::StageError;

use crate::config::types::RetryConfig;

/// Backoff decisions derived from a pipeline's [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether a failed attempt should be followed by another.
    ///
    /// `attempt` is 1-based; the final attempt is never followed by
    /// another regardless of classification.
    #[must_use]
    pub fn should_retry(&self, error: &StageError, attempt: u32) -> bool {
        error.is_recoverable() && attempt < self.config.max_attempts
    }

    /// Delay before the given attempt's retry, pre-jitter.
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn backoff_before_jitter(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(
            i32::try_from(exponent).unwrap_or(i32::MAX),
        );
        let capped = raw.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to sleep after a failed attempt, honoring the error's
    /// `retry_after_ms` hint when present.
    #[must_use]
    pub fn delay(&self, error: &StageError, attempt: u32) -> Duration {
        if let Some(ms) = error.retry_after_ms {
            return Duration::from_millis(ms);
        }
        self.apply_jitter(self.backoff_before_jitter(attempt))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let ms = delay.as_millis() as f64;
        let spread = ms * self.config.jitter;
        let jittered = rand::thread_rng().gen_range(-spread..=spread) + ms;
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
