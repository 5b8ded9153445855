//! Circuit breaker around mining attempts.
//!
//! Closed: failures inside the window are counted. Reaching the threshold
//! opens the breaker and every attempt fails fast until the cooldown has
//! elapsed. The breaker then half-opens and lets a bounded number of trial
//! attempts through. A trial success closes it; a trial failure opens it again.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
    pub half_open_trials: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(30),
            half_open_trials: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { trials_left: usize },
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half-open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerOpen {
    pub retry_after: Duration,
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    trips: u64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                half_open_trials: config.half_open_trials.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                trips: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// How many times the breaker has opened.
    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }

    pub fn allow(&self) -> Result<(), BreakerOpen> {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { until } if now < until => Err(BreakerOpen {
                retry_after: until - now,
            }),
            BreakerState::Open { .. } => {
                inner.state = BreakerState::HalfOpen {
                    trials_left: self.config.half_open_trials - 1,
                };
                Ok(())
            }
            BreakerState::HalfOpen { trials_left: 0 } => Err(BreakerOpen {
                retry_after: Duration::ZERO,
            }),
            BreakerState::HalfOpen { trials_left } => {
                inner.state = BreakerState::HalfOpen {
                    trials_left: trials_left - 1,
                };
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen { .. } => self.trip(&mut inner, now),
            BreakerState::Open { .. } => {}
            BreakerState::Closed => {
                inner.failures.push_back(now);
                while let Some(first) = inner.failures.front() {
                    if now.saturating_duration_since(*first) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.failures.clear();
        inner.state = BreakerState::Open {
            until: now + self.config.cooldown,
        };
        inner.trips += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
            half_open_trials: 2,
        })
    }

    #[test]
    fn opens_after_threshold_and_fails_fast() {
        let breaker = breaker();
        let start = Instant::now();
        for offset in 0..3 {
            assert!(breaker.allow_at(start).is_ok());
            breaker.record_failure_at(start + Duration::from_secs(offset));
        }
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
        let err = breaker.allow_at(start + Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(7));
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let breaker = breaker();
        let start = Instant::now();
        breaker.record_failure_at(start);
        breaker.record_failure_at(start + Duration::from_secs(61));
        breaker.record_failure_at(start + Duration::from_secs(62));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure_at(start + Duration::from_secs(63));
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
    }

    #[test]
    fn half_open_allows_bounded_trials_then_closes() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }
        let later = start + Duration::from_secs(11);
        assert!(breaker.allow_at(later).is_ok());
        assert!(breaker.allow_at(later).is_ok());
        assert!(breaker.allow_at(later).is_err());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_at(later).is_ok());
    }

    #[test]
    fn trial_failure_reopens() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }
        let later = start + Duration::from_secs(11);
        assert!(breaker.allow_at(later).is_ok());
        breaker.record_failure_at(later);
        assert_eq!(
            breaker.state(),
            BreakerState::Open {
                until: later + Duration::from_secs(10)
            }
        );
        assert_eq!(breaker.trips(), 2);
    }
}
