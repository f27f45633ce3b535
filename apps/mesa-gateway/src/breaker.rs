use std::time::{Duration, Instant};

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::BrokerUnavailable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_for_secs: Option<u64>,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Guards every broker operation. While OPEN, callers fail fast with
/// [`BrokerUnavailable`] instead of stacking timeouts on a degraded broker.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, half_open_max: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            failure_threshold,
            cooldown,
            half_open_max,
        }
    }

    /// Gate ahead of a broker call. `Err` means do not attempt the call.
    pub fn try_acquire(&self) -> Result<(), BrokerUnavailable> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), BrokerUnavailable> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    info!("circuit breaker half-open, probing broker");
                    gauge!("mesa_gateway_breaker_state", inner.state.as_gauge());
                    Ok(())
                } else {
                    Err(BrokerUnavailable)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BrokerUnavailable)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                info!("circuit breaker closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                gauge!("mesa_gateway_breaker_state", inner.state.as_gauge());
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    gauge!("mesa_gateway_breaker_state", inner.state.as_gauge());
                }
            }
            BreakerState::HalfOpen => {
                warn!("probe failed, circuit breaker reopened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_in_flight = 0;
                gauge!("mesa_gateway_breaker_state", inner.state.as_gauge());
            }
            BreakerState::Open => {
                inner.opened_at = Some(now);
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for_secs: inner.opened_at.map(|at| at.elapsed().as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(30), 3)
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            b.record_failure_at(now);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure_at(now);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn open_fails_fast_until_cooldown() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            b.record_failure_at(now);
        }

        assert_eq!(b.try_acquire_at(now + Duration::from_secs(1)), Err(BrokerUnavailable));
        assert_eq!(b.try_acquire_at(now + Duration::from_secs(29)), Err(BrokerUnavailable));

        // Cooldown elapsed: the next call goes through as a half-open probe,
        // and a single success closes the breaker.
        assert!(b.try_acquire_at(now + Duration::from_secs(30)).is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens_and_resets_cooldown() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            b.record_failure_at(now);
        }

        let probe_at = now + Duration::from_secs(30);
        assert!(b.try_acquire_at(probe_at).is_ok());
        b.record_failure_at(probe_at);
        assert_eq!(b.state(), BreakerState::Open);

        // The cooldown restarts from the probe failure.
        assert_eq!(
            b.try_acquire_at(probe_at + Duration::from_secs(29)),
            Err(BrokerUnavailable)
        );
        assert!(b.try_acquire_at(probe_at + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn half_open_bounds_concurrent_probes() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            b.record_failure_at(now);
        }

        let probe_at = now + Duration::from_secs(30);
        assert!(b.try_acquire_at(probe_at).is_ok());
        assert!(b.try_acquire_at(probe_at).is_ok());
        assert!(b.try_acquire_at(probe_at).is_ok());
        assert_eq!(b.try_acquire_at(probe_at), Err(BrokerUnavailable));
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            b.record_failure_at(now);
        }
        b.record_success();
        b.record_failure_at(now);
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
