//! Exponential backoff with jitter
//!
//! `delay(n) = min(base * 2^min(n, MAX_EXP), cap) * factor`, with `factor`
//! drawn uniformly from `[1 - jitter, 1]`. Jitter only ever shortens a delay,
//! so the cap holds after jitter too. The exponent is clamped before it is
//! applied; no attempt number can overflow or produce NaN.

use crate::config::TransportConfig;
use rand::{thread_rng, Rng};
use std::time::Duration;

/// Largest exponent applied to a base delay
pub const MAX_EXP: u32 = 20;

/// `min(base_ms * multiplier^min(exp, MAX_EXP), cap_ms)` in milliseconds.
///
/// Shared by transport backoff and breaker cooldown. Non-finite or
/// out-of-range intermediates collapse to `cap_ms`.
pub fn clamped_exponential(base_ms: u64, multiplier: f64, exp: u32, cap_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    let factor = multiplier.max(1.0).powi(exp.min(MAX_EXP) as i32);
    let scaled = base_ms as f64 * factor;
    if !scaled.is_finite() || scaled >= cap_ms as f64 {
        cap_ms
    } else {
        (scaled.round() as u64).min(cap_ms)
    }
}

/// Retry timing for one transport send
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
    max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64, max_retries: u32) -> Self {
        let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
            max_retries,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.jitter,
            config.max_retries,
        )
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry `attempt` (0-based), without jitter
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(clamped_exponential(self.base_ms, 2.0, attempt, self.max_ms))
    }

    /// Delay before retry `attempt` (0-based), with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            thread_rng().gen_range(0.0..=1.0)
        } else {
            1.0
        };
        self.delay_with_sample(attempt, sample)
    }

    /// Jittered delay for a given uniform `sample` in `[0, 1]`.
    ///
    /// `sample = 1.0` yields the raw delay, `0.0` the shortest allowed.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let raw = self.raw_delay(attempt);
        if raw.is_zero() || self.jitter <= 0.0 {
            return raw;
        }
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let factor = 1.0 - self.jitter * (1.0 - sample);
        let millis = (raw.as_millis() as f64 * factor).round().max(0.0);
        Duration::from_millis((millis as u64).min(self.max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 0.2, 3)
    }

    #[test]
    fn test_raw_delays_double_until_cap() {
        let p = policy();
        assert_eq!(p.raw_delay(0), Duration::from_millis(500));
        assert_eq!(p.raw_delay(1), Duration::from_millis(1000));
        assert_eq!(p.raw_delay(2), Duration::from_millis(2000));
        assert_eq!(p.raw_delay(6), Duration::from_secs(30));
        assert_eq!(p.raw_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy();
        assert_eq!(p.delay_with_sample(1, 1.0), Duration::from_millis(1000));
        assert_eq!(p.delay_with_sample(1, 0.0), Duration::from_millis(800));
        assert_eq!(p.delay_with_sample(1, f64::NAN), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_base_never_waits() {
        let p = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 0.5, 3);
        assert_eq!(p.delay(10), Duration::ZERO);
    }

    #[test]
    fn test_clamped_exponential_handles_extremes() {
        assert_eq!(clamped_exponential(30_000, 2.0, 0, 900_000), 30_000);
        assert_eq!(clamped_exponential(30_000, 2.0, 3, 900_000), 240_000);
        assert_eq!(clamped_exponential(30_000, 2.0, 50, 900_000), 900_000);
        assert_eq!(clamped_exponential(u64::MAX, 1e300, 20, 5), 5);
        assert_eq!(clamped_exponential(1, f64::NAN, 3, 100), 1);
    }

    proptest! {
        #[test]
        fn prop_raw_delay_is_monotone(
            base in 0u64..100_000,
            extra in 0u64..10_000_000,
            attempt in 0u32..200,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(base),
                Duration::from_millis(base + extra),
                0.0,
                3,
            );
            prop_assert!(p.raw_delay(attempt) <= p.raw_delay(attempt + 1));
        }

        #[test]
        fn prop_delay_never_exceeds_cap(
            base in 0u64..100_000,
            extra in 0u64..10_000_000,
            jitter in 0.0f64..=1.0,
            attempt in any::<u32>(),
            sample in 0.0f64..=1.0,
        ) {
            let cap = Duration::from_millis(base + extra);
            let p = BackoffPolicy::new(Duration::from_millis(base), cap, jitter, 3);
            let delay = p.delay_with_sample(attempt, sample);
            prop_assert!(delay <= cap);
            prop_assert!(delay <= p.raw_delay(attempt));
        }

        #[test]
        fn prop_clamped_exponential_within_bounds(
            base in 0u64..u64::MAX,
            multiplier in 1.0f64..1e6,
            exp in any::<u32>(),
            cap in 0u64..u64::MAX,
        ) {
            let value = clamped_exponential(base, multiplier, exp, cap);
            prop_assert!(value <= cap);
        }
    }
}
