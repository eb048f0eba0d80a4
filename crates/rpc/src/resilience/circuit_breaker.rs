//! Per-peer circuit breaker.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

/// Thresholds and timing of a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Error count at which the breaker opens.
    pub max_errors: u32,
    /// Error rate above which the breaker opens.
    pub max_error_rate: f64,
    /// Requests required before the error rate is considered.
    pub min_requests: u32,
    /// How long the breaker stays open, in milliseconds.
    pub cool_down_ms: u64,
    /// Admit a single trial call after the cool-down instead of closing outright.
    pub half_open: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_errors: 10,
            max_error_rate: 0.5,
            min_requests: 1,
            cool_down_ms: 5_000,
            half_open: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cool-down as a duration.
    #[must_use]
    pub const fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Serving calls.
    Closed,
    /// Rejecting calls until the cool-down elapses.
    Open,
    /// Cool-down elapsed; one trial call decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    requests: u32,
    errors: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Two-state (optionally three-state) circuit breaker.
///
/// The cool-down is applied lazily: the first check after it elapses resets
/// the breaker, so no timer task is needed.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                requests: 0,
                errors: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Whether calls are currently rejected.
    #[must_use]
    pub fn is_break(&self) -> bool {
        let mut inner = self.inner.lock();
        self.expire_cool_down(&mut inner);
        inner.state == BreakerState::Open
    }

    /// Ask to send one call through the breaker.
    ///
    /// In half-open mode only the first caller after the cool-down is admitted
    /// until its outcome is recorded. Dropping the returned [`Admission`]
    /// without recording an outcome frees the trial slot again.
    #[must_use]
    pub fn try_admit(&self) -> Option<Admission<'_>> {
        let mut inner = self.inner.lock();
        self.expire_cool_down(&mut inner);

        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => return None,
            BreakerState::HalfOpen if inner.trial_in_flight => return None,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
        };

        Some(Admission {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a call that reached the peer.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::HalfOpen {
            debug!("trial call succeeded, closing breaker");
            Self::close(&mut inner);
            return;
        }

        inner.requests = inner.requests.saturating_add(1);
    }

    /// Record a failed call. Failures count as requests too.
    pub fn record_error(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::HalfOpen => {
                debug!("trial call failed, reopening breaker");
                Self::open(&mut inner);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                inner.requests = inner.requests.saturating_add(1);
                inner.errors = inner.errors.saturating_add(1);

                if self.threshold_crossed(&inner) {
                    info!(
                        "opening breaker after {} errors in {} requests",
                        inner.errors, inner.requests
                    );
                    Self::open(&mut inner);
                }
            }
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        Self::close(&mut self.inner.lock());
    }

    /// Current state, after applying any elapsed cool-down.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.expire_cool_down(&mut inner);
        inner.state
    }

    /// `(requests, errors)` recorded since the breaker last closed.
    #[must_use]
    pub fn counts(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.requests, inner.errors)
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.trial_in_flight {
            debug!("trial call abandoned, admitting another");
            inner.trial_in_flight = false;
        }
    }

    fn threshold_crossed(&self, inner: &Inner) -> bool {
        if inner.errors >= self.config.max_errors {
            return true;
        }

        inner.requests >= self.config.min_requests.max(1)
            && f64::from(inner.errors) / f64::from(inner.requests) > self.config.max_error_rate
    }

    fn expire_cool_down(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }

        let elapsed = inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.cool_down());
        if !elapsed {
            return;
        }

        if self.config.half_open {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
        } else {
            Self::close(inner);
        }
    }

    fn open(inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
    }

    fn close(inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.requests = 0;
        inner.errors = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

/// A call let through by [`CircuitBreaker::try_admit`].
#[derive(Debug)]
#[must_use = "dropping an admission records no outcome"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    /// Whether this call is the half-open trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call reached the peer.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// The call failed in transport.
    pub fn error(mut self) {
        self.settled = true;
        self.breaker.record_error();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
