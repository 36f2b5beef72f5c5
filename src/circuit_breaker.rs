//! Circuit breaker protecting one upstream transport.
//!
//! Three states:
//! - **Closed**: calls pass through; consecutive failures are counted and
//!   the counter is cleared on a fixed interval.
//! - **Open**: calls are rejected immediately until the half-open delay
//!   elapses.
//! - **HalfOpen**: a bounded number of trial calls is let through; one
//!   success closes the breaker, one failure reopens it.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::error;

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls flow through.
    Closed,
    /// Calls are rejected without reaching the backend.
    Open,
    /// Trial calls probe whether the backend recovered.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Consecutive failures since the last success or interval reset.
    failures: u32,
    /// Trial calls currently in flight while half-open.
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_reset: Instant,
}

/// Per-transport circuit breaker.
///
/// All mutable state lives behind a single lock; many requests share one
/// breaker concurrently and every transition is serialized through it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a breaker in the Closed state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_reset: Instant::now(),
            }),
        }
    }

    /// Asks permission to make one call.
    ///
    /// Returns `false` when the breaker is open, or half-open with all
    /// trial slots taken. A `true` result must be paired with exactly one
    /// [`record`](Self::record) once the call completes.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => {
                if inner.last_reset.elapsed() >= self.config.clear_failure_count_interval() {
                    inner.failures = 0;
                    inner.last_reset = Instant::now();
                }
                true
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.half_open_after())
                    .unwrap_or(false);
                if elapsed {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_half_open_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records the outcome of a permitted call.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.failures = 0;
                } else {
                    inner.failures += 1;
                    if inner.failures >= self.config.failures_to_open {
                        self.transition(&mut inner, BreakerState::Open);
                        inner.opened_at = Some(Instant::now());
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if success {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.failures = 0;
                    inner.half_open_in_flight = 0;
                    inner.last_reset = Instant::now();
                } else {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_in_flight = 0;
                }
            }
            // A call admitted before the breaker opened finished late;
            // its outcome no longer changes anything.
            BreakerState::Open => {}
        }
    }

    /// Returns the breaker's current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Returns the current consecutive-failure count.
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Returns the breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // State transitions are an operational signal, logged at error severity.
    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        error!(
            breaker = %self.name,
            from = ?inner.state,
            to = ?to,
            "circuit breaker state change"
        );
        inner.state = to;
    }
}
