//! Circuit breaker gating flush cycles
//!
//! ```text
//! Closed --(threshold failures)--> Open --(cooldown elapsed)--> HalfOpen
//!   ^                                ^                             |
//!   |                                +-------(probe fails)---------+
//!   +-------------------------(probe succeeds)---------------------+
//! ```
//!
//! Time is always passed in, so the breaker can be driven by a manual clock.

use crate::backoff::clamped_exponential;
use crate::config::BreakerConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Consecutive trips without an intervening success
    pub trips: u32,
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    trips: u32,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown_base_ms: u64,
    cooldown_max_ms: u64,
    multiplier: f64,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            cooldown_base_ms: config.cooldown_base_ms,
            cooldown_max_ms: config.cooldown_max_ms.max(config.cooldown_base_ms),
            multiplier: config.cooldown_multiplier,
            inner: Mutex::new(Inner {
                phase: Phase::Closed { failures: 0 },
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a flush cycle may run now.
    ///
    /// In half-open state exactly one caller gets `true` (the probe) until
    /// the probe's outcome is recorded or it is released.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.phase {
            Phase::Closed { .. } => true,
            Phase::Open { until } if now >= until => {
                tracing::info!("Circuit half-open, admitting probe");
                inner.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
            Phase::Open { .. } => false,
            Phase::HalfOpen {
                probe_in_flight: true,
            } => false,
            Phase::HalfOpen {
                probe_in_flight: false,
            } => {
                inner.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(inner.phase, Phase::Closed { failures: 0 }) {
            tracing::info!("Circuit closed");
        }
        inner.phase = Phase::Closed { failures: 0 };
        inner.trips = 0;
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.phase {
            Phase::Closed { failures } => {
                let failures = failures.saturating_add(1);
                if failures >= self.threshold {
                    self.trip(inner, now);
                } else {
                    inner.phase = Phase::Closed { failures };
                }
            }
            Phase::HalfOpen { .. } => self.trip(inner, now),
            // Late result from a cycle that started before the trip
            Phase::Open { .. } => {}
        }
    }

    /// Hand back an unused half-open probe
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if let Phase::HalfOpen { probe_in_flight } = &mut inner.phase {
            *probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let (state, consecutive_failures, open_until) = match inner.phase {
            Phase::Closed { failures } => (CircuitState::Closed, failures, None),
            Phase::Open { until } => (CircuitState::Open, 0, Some(until)),
            Phase::HalfOpen { .. } => (CircuitState::HalfOpen, 0, None),
        };
        BreakerSnapshot {
            state,
            consecutive_failures,
            trips: inner.trips,
            open_until,
        }
    }

    /// Cooldown after the `trips`-th consecutive trip (1-based)
    pub fn cooldown_for(&self, trips: u32) -> Duration {
        let ms = clamped_exponential(
            self.cooldown_base_ms,
            self.multiplier,
            trips.saturating_sub(1),
            self.cooldown_max_ms,
        );
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000))
    }

    fn trip(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.trips = inner.trips.saturating_add(1);
        let cooldown = self.cooldown_for(inner.trips);
        let until = now
            .checked_add_signed(cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tracing::warn!(
            trips = inner.trips,
            cooldown_ms = cooldown.num_milliseconds(),
            "Circuit opened"
        );
        inner.phase = Phase::Open { until };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: 3,
            cooldown_base_ms: 1_000,
            cooldown_max_ms: 10_000,
            cooldown_multiplier: 2.0,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        b.record_failure(t0());
        b.record_failure(t0());
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow(t0()));

        b.record_failure(t0());
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow(t0() + Duration::milliseconds(999)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker();
        b.record_failure(t0());
        b.record_failure(t0());
        b.record_success();
        b.record_failure(t0());
        assert_eq!(b.snapshot().consecutive_failures, 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(t0());
        }
        let later = t0() + Duration::seconds(1);

        assert!(b.allow(later));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.allow(later));
        assert!(!b.allow(later));

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow(later));
    }

    #[test]
    fn test_failed_probe_reopens_with_longer_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(t0());
        }
        let probe_at = t0() + Duration::seconds(1);
        assert!(b.allow(probe_at));
        b.record_failure(probe_at);

        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.trips, 2);
        assert_eq!(snap.open_until, Some(probe_at + Duration::seconds(2)));
    }

    #[test]
    fn test_released_probe_can_be_taken_again() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(t0());
        }
        let later = t0() + Duration::seconds(5);
        assert!(b.allow(later));
        b.release_probe();
        assert!(b.allow(later));
        assert!(!b.allow(later));
    }

    #[test]
    fn test_cooldown_growth_is_capped() {
        let b = breaker();
        assert_eq!(b.cooldown_for(1), Duration::seconds(1));
        assert_eq!(b.cooldown_for(2), Duration::seconds(2));
        assert_eq!(b.cooldown_for(4), Duration::seconds(8));
        assert_eq!(b.cooldown_for(5), Duration::seconds(10));
        assert_eq!(b.cooldown_for(u32::MAX), Duration::seconds(10));
    }

    #[test]
    fn test_failures_while_open_are_ignored() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(t0());
        }
        let until = b.snapshot().open_until;
        b.record_failure(t0() + Duration::milliseconds(500));
        assert_eq!(b.snapshot().open_until, until);
        assert_eq!(b.snapshot().trips, 1);
    }
}
