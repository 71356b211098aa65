//! Circuit breaker wrapping each outbound dependency.
//!
//! State-machine idiom borrowed from [`crate::runtimes::runner::StepResult`]:
//! a small enum driven by explicit transition methods rather than
//! inheritance, with every transition observable so callers can emit a
//! change event.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub min_requests: u32,
    pub trip_ratio: f64,
    pub reset_timeout_secs: u64,
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            trip_ratio: 0.5,
            reset_timeout_secs: 30,
            half_open_max: 1,
        }
    }
}

struct Window {
    requests: u32,
    failures: u32,
}

struct BreakerState {
    state: CircuitState,
    window: Window,
    opened_at_secs: u64,
    half_open_in_flight: u32,
}

/// A change in circuit state, for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit is open")]
    CircuitOpen,
    #[error(transparent)]
    Inner(#[from] E),
}

/// Wraps an outbound dependency with trip/half-open/reset behavior.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    trips_total: AtomicU32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: Window {
                    requests: 0,
                    failures: 0,
                },
                opened_at_secs: 0,
                half_open_in_flight: 0,
            }),
            trips_total: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn state(&self, now_secs: u64) -> CircuitState {
        self.maybe_half_open(now_secs)
    }

    #[must_use]
    pub fn trips_total(&self) -> u32 {
        self.trips_total.load(Ordering::Relaxed)
    }

    fn maybe_half_open(&self, now_secs: u64) -> CircuitState {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open
            && now_secs.saturating_sub(state.opened_at_secs) >= self.config.reset_timeout_secs
        {
            state.state = CircuitState::HalfOpen;
            state.half_open_in_flight = 0;
        }
        state.state
    }

    /// Admits a probe if half-open and under `half_open_max`; returns the
    /// observed state pre-admission so callers know whether `fn` will run.
    fn try_admit(&self, now_secs: u64) -> Result<CircuitState, ()> {
        let current = self.maybe_half_open(now_secs);
        match current {
            CircuitState::Open => Err(()),
            CircuitState::Closed => Ok(current),
            CircuitState::HalfOpen => {
                let mut state = self.state.lock();
                if state.half_open_in_flight >= self.config.half_open_max {
                    Err(())
                } else {
                    state.half_open_in_flight += 1;
                    Ok(current)
                }
            }
        }
    }

    fn record_result(&self, admitted_state: CircuitState, success: bool, now_secs: u64) {
        let mut state = self.state.lock();
        match admitted_state {
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                if success {
                    state.state = CircuitState::Closed;
                    state.window = Window {
                        requests: 0,
                        failures: 0,
                    };
                } else {
                    state.state = CircuitState::Open;
                    state.opened_at_secs = now_secs;
                    self.trips_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::Closed => {
                state.window.requests += 1;
                if !success {
                    state.window.failures += 1;
                }
                let ratio = if state.window.requests > 0 {
                    f64::from(state.window.failures) / f64::from(state.window.requests)
                } else {
                    0.0
                };
                if state.window.requests >= self.config.min_requests
                    && ratio >= self.config.trip_ratio
                {
                    state.state = CircuitState::Open;
                    state.opened_at_secs = now_secs;
                    self.trips_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Executes `f` if the breaker admits the call; returns `CircuitOpen`
    /// without invoking `f` otherwise.
    pub async fn execute<T, E, F, Fut>(&self, now_secs: u64, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted = self.try_admit(now_secs).map_err(|()| BreakerError::CircuitOpen)?;
        let result = f().await;
        self.record_result(admitted, result.is_ok(), now_secs);
        result.map_err(BreakerError::Inner)
    }

    /// As [`Self::execute`], but calls `fallback` instead of surfacing
    /// `CircuitOpen` when the breaker rejects the call.
    pub async fn execute_with_fallback<T, E, F, Fut, Fb, FbFut>(
        &self,
        now_secs: u64,
        f: F,
        fallback: Fb,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        match self.try_admit(now_secs) {
            Err(()) => fallback().await,
            Ok(admitted) => {
                let result = f().await;
                self.record_result(admitted, result.is_ok(), now_secs);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_requests: u32, half_open_max: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            min_requests,
            trip_ratio: 0.5,
            reset_timeout_secs: 10,
            half_open_max,
        }
    }

    #[tokio::test]
    async fn trips_after_min_requests_and_ratio_exceeded() {
        let breaker = CircuitBreaker::new(config(4, 1));
        for i in 0..4u32 {
            let _ = breaker
                .execute::<(), &str, _, _>(0, || async move {
                    if i < 2 { Err("boom") } else { Ok(()) }
                })
                .await;
        }
        assert_eq!(breaker.state(0), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_never_invokes_the_function() {
        let breaker = CircuitBreaker::new(config(1, 1));
        let _ = breaker
            .execute::<(), &str, _, _>(0, || async { Err("boom") })
            .await;
        assert_eq!(breaker.state(0), CircuitState::Open);

        let mut invoked = false;
        let result = breaker
            .execute::<(), &str, _, _>(0, || {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen)));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let breaker = CircuitBreaker::new(config(1, 1));
        let _ = breaker
            .execute::<(), &str, _, _>(0, || async { Err("boom") })
            .await;
        assert_eq!(breaker.state(0), CircuitState::Open);
        // past reset_timeout_secs=10
        assert_eq!(breaker.state(11), CircuitState::HalfOpen);
        let result = breaker.execute::<(), &str, _, _>(11, || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(11), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new(config(1, 1));
        let _ = breaker
            .execute::<(), &str, _, _>(0, || async { Err("boom") })
            .await;
        assert_eq!(breaker.state(11), CircuitState::HalfOpen);
        let _ = breaker
            .execute::<(), &str, _, _>(11, || async { Err("boom") })
            .await;
        assert_eq!(breaker.state(11), CircuitState::Open);
        assert_eq!(breaker.state(20), CircuitState::Open, "timer restarted at 11");
        assert_eq!(breaker.state(21), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_caps_concurrent_probes() {
        let breaker = CircuitBreaker::new(config(1, 2));
        let _ = breaker
            .execute::<(), &str, _, _>(0, || async { Err("boom") })
            .await;
        assert_eq!(breaker.state(11), CircuitState::HalfOpen);
        assert!(breaker.try_admit(11).is_ok());
        assert!(breaker.try_admit(11).is_ok());
        assert!(breaker.try_admit(11).is_err(), "a third probe must be rejected");
    }

    #[tokio::test]
    async fn fallback_invoked_when_open() {
        let breaker = CircuitBreaker::new(config(1, 1));
        let _ = breaker
            .execute::<(), &str, _, _>(0, || async { Err("boom") })
            .await;
        let result = breaker
            .execute_with_fallback::<&str, &str, _, _, _, _>(
                0,
                || async { Ok("primary") },
                || async { Ok("fallback") },
            )
            .await;
        assert_eq!(result, Ok("fallback"));
    }
}
