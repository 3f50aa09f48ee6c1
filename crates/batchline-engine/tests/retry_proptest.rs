//! Property tests for retry policy invariants.

use std::time::Duration;

use proptest::prelude::*;

use batchline_engine::retry::RetryPolicy;
use batchline_engine::RetryConfig;
use batchline_types::error::StageError;

fn config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u32..=10, 1u64..=5_000, 1.0f64..=4.0, 1u64..=120_000, 0.0f64..0.5).prop_map(
        |(max_attempts, base_delay_ms, backoff_multiplier, max_delay_ms, jitter)| RetryConfig {
            max_attempts,
            base_delay_ms,
            backoff_multiplier,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter,
        },
    )
}

proptest! {
    /// Pre-jitter backoff never decreases from one attempt to the next.
    #[test]
    fn backoff_is_monotonic(config in config_strategy()) {
        let policy = RetryPolicy::new(config);
        let mut previous = Duration::ZERO;
        for attempt in 1..=12u32 {
            let delay = policy.backoff_before_jitter(attempt);
            prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            previous = delay;
        }
    }

    /// Pre-jitter backoff never exceeds the configured ceiling.
    #[test]
    fn backoff_respects_ceiling(config in config_strategy(), attempt in 1u32..=64) {
        let max_delay = Duration::from_millis(config.max_delay_ms);
        let policy = RetryPolicy::new(config);
        prop_assert!(policy.backoff_before_jitter(attempt) <= max_delay);
    }

    /// Jittered delay stays within the configured fraction of the
    /// pre-jitter value.
    #[test]
    fn jitter_stays_in_band(config in config_strategy(), attempt in 1u32..=10) {
        let policy = RetryPolicy::new(config.clone());
        let base = policy.backoff_before_jitter(attempt).as_millis() as f64;
        let err = StageError::source_transient("CONN_RESET", "reset");
        let delay = policy.delay(&err, attempt).as_millis() as f64;
        // One extra millisecond of slack for truncation.
        let spread = base * config.jitter + 1.0;
        prop_assert!(delay >= base - spread && delay <= base + spread);
    }

    /// The total attempt count is bounded by max_attempts: the final
    /// attempt never schedules another retry, and earlier recoverable
    /// failures always do.
    #[test]
    fn attempts_bounded_by_policy(config in config_strategy()) {
        let max = config.max_attempts;
        let policy = RetryPolicy::new(config);
        let recoverable = StageError::sink_transient("DEADLOCK", "deadlock");
        for attempt in 1..max {
            prop_assert!(policy.should_retry(&recoverable, attempt));
        }
        prop_assert!(!policy.should_retry(&recoverable, max));
        prop_assert!(!policy.should_retry(&recoverable, max + 1));
    }

    /// Fatal and validation errors never retry, whatever the config.
    #[test]
    fn fatal_never_retries(config in config_strategy(), attempt in 1u32..=10) {
        let policy = RetryPolicy::new(config);
        prop_assert!(!policy.should_retry(&StageError::source_fatal("AUTH", "denied"), attempt));
        prop_assert!(!policy.should_retry(&StageError::validation("GATE_FAILED", "bad"), attempt));
        prop_assert!(!policy.should_retry(&StageError::config("BAD", "bad"), attempt));
    }

    /// An explicit retry-after hint always wins over computed backoff.
    #[test]
    fn retry_after_hint_takes_precedence(config in config_strategy(), hint in 0u64..=600_000) {
        let policy = RetryPolicy::new(config);
        let err = StageError::rate_limited("THROTTLED", "429", Some(hint));
        prop_assert_eq!(policy.delay(&err, 1), Duration::from_millis(hint));
    }
}
