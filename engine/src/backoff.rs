//! Retry delays for failed deliveries.

use std::time::Duration;

/// Capped exponential backoff keyed on the attempt counter.
///
/// `delay(n) = min(base * multiplier^(n - 1), max)`
///
/// With the defaults (5s base, ×2, 5min cap):
/// - attempt 1: 5s
/// - attempt 2: 10s
/// - attempt 3: 20s
/// - attempt 7 and later: 5min
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Growth factor per further failure
    pub multiplier: f64,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            multiplier: 2.0,
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            ..Self::default()
        }
    }

    /// Delay to wait after `attempts` failures (1-indexed; 0 is treated as 1).
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(7), Duration::from_secs(300));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn max_never_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(10));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let policy = BackoffPolicy {
            multiplier: 0.5,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(4), policy.base);
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(
            base_ms in 1u64..60_000,
            max_ms in 1u64..3_600_000,
            failures in 1u32..200,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );

            let mut previous = Duration::ZERO;
            for n in 1..=failures {
                let delay = policy.delay(n);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max);
                previous = delay;
            }
        }
    }
}
