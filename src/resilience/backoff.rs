//! Backoff delay calculation with optional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffStrategy, RetryPolicy};

/// Delay before retry number `attempt` (0-based), capped at `max_delay`,
/// without jitter.
pub fn base_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base_ms = policy.base_delay_ms as f64;
    let delay_ms = match policy.backoff_strategy {
        BackoffStrategy::Constant => base_ms,
        BackoffStrategy::Linear => base_ms * (f64::from(attempt) + 1.0),
        BackoffStrategy::Exponential => {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            base_ms * policy.multiplier.powi(exponent)
        }
    };

    // NaN or overflow to infinity both land on the cap.
    let capped_ms = if delay_ms.is_finite() {
        delay_ms.min(policy.max_delay_ms as f64)
    } else {
        policy.max_delay_ms as f64
    };
    Duration::from_micros((capped_ms.max(0.0) * 1000.0).round() as u64)
}

/// Calculate the delay before retry number `attempt` (0-based).
///
/// With jitter enabled, `uniform(0, 0.25 * delay)` is added after the cap.
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = base_backoff(policy, attempt);
    if !policy.jitter {
        return delay;
    }

    let jitter_range = delay.as_secs_f64() * 0.25;
    let jitter = if jitter_range > 0.0 {
        rand::thread_rng().gen_range(0.0..jitter_range)
    } else {
        0.0
    };
    delay + Duration::from_secs_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_strategy: strategy,
            multiplier: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_strategies() {
        let constant = policy(BackoffStrategy::Constant);
        assert_eq!(base_backoff(&constant, 0), Duration::from_millis(100));
        assert_eq!(base_backoff(&constant, 5), Duration::from_millis(100));

        let linear = policy(BackoffStrategy::Linear);
        assert_eq!(base_backoff(&linear, 0), Duration::from_millis(100));
        assert_eq!(base_backoff(&linear, 2), Duration::from_millis(300));

        let exponential = policy(BackoffStrategy::Exponential);
        assert_eq!(base_backoff(&exponential, 0), Duration::from_millis(100));
        assert_eq!(base_backoff(&exponential, 1), Duration::from_millis(200));
        assert_eq!(base_backoff(&exponential, 3), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_is_monotonic_and_capped() {
        let exponential = policy(BackoffStrategy::Exponential);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = calculate_backoff(&exponential, attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= Duration::from_millis(2000));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(2000));
        assert_eq!(base_backoff(&exponential, u32::MAX), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let jittered = RetryPolicy {
            jitter: true,
            ..policy(BackoffStrategy::Constant)
        };
        for _ in 0..200 {
            let delay = calculate_backoff(&jittered, 0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }
}
