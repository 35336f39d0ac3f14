//! Circuit breaker: fail fast once an operation class keeps failing.
//!
//! # States
//!
//! - **Closed**: calls pass through; each failure increments the failure
//!   count. Reaching `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected without running until `reset_timeout` has
//!   elapsed since the last failure.
//! - **HalfOpen**: exactly one trial call is let through. Success closes the
//!   circuit and zeroes the failure count; failure re-opens it.
//!
//! While closed, [`CircuitBreaker::decay`] (driven by [`CircuitBreaker::run_decay`])
//! lowers the failure count by one per monitoring period so isolated
//! failures age out.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lock;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial call.
    pub reset_timeout: Duration,
    /// Decay period for the failure count while closed.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Errors from a call through the breaker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// Rejected without running.
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub request_count: u64,
    pub rejected_count: u64,
    /// Failed calls over calls that actually ran (0.0 to 1.0).
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// A half-open trial call is running.
    trial_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Shared circuit breaker for one operation class. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    last_failure: None,
                    trial_in_flight: false,
                }),
                requests: AtomicU64::new(0),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                rejections: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state, without triggering the OPEN → HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        lock(&self.inner.state).state
    }

    pub fn failure_count(&self) -> u32 {
        lock(&self.inner.state).failure_count
    }

    /// Run `op` through the breaker.
    ///
    /// # Errors
    ///
    /// [`CircuitError::Open`] if the call was rejected, [`CircuitError::Inner`]
    /// if it ran and failed.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.try_acquire() else {
            self.inner.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(breaker = %self.inner.name, "circuit open, rejecting call");
            return Err(CircuitError::Open(self.inner.name.clone()));
        };

        let mut pending = PendingCall {
            breaker: self,
            admission,
            settled: false,
        };
        let result = op().await;
        pending.settled = true;

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission);
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Like [`call`](Self::call), but a rejected call is answered by `fallback`.
    pub async fn call_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = T>,
    {
        match self.call(op).await {
            Err(CircuitError::Open(_)) => Ok(fallback().await),
            other => other,
        }
    }

    /// Decide whether a call may run, performing the OPEN → HALF_OPEN
    /// transition when the reset timeout has elapsed.
    fn try_acquire(&self) -> Option<Admission> {
        let mut st = lock(&self.inner.state);
        match st.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let ready = st
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.inner.config.reset_timeout);
                if !ready {
                    return None;
                }
                info!(breaker = %self.inner.name, "circuit OPEN -> HALF_OPEN");
                st.state = CircuitState::HalfOpen;
                st.trial_in_flight = true;
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen if st.trial_in_flight => None,
            CircuitState::HalfOpen => {
                st.trial_in_flight = true;
                Some(Admission::Trial)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        self.inner.successes.fetch_add(1, Ordering::Relaxed);
        let mut st = lock(&self.inner.state);
        if admission == Admission::Trial && st.state == CircuitState::HalfOpen {
            info!(breaker = %self.inner.name, "circuit HALF_OPEN -> CLOSED");
            st.state = CircuitState::Closed;
            st.failure_count = 0;
            st.trial_in_flight = false;
        }
    }

    fn on_failure(&self, admission: Admission) {
        self.inner.failures.fetch_add(1, Ordering::Relaxed);
        let mut st = lock(&self.inner.state);
        st.last_failure = Some(Instant::now());
        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.inner.config.failure_threshold {
                    warn!(
                        breaker = %self.inner.name,
                        failures = st.failure_count,
                        threshold = self.inner.config.failure_threshold,
                        "circuit CLOSED -> OPEN"
                    );
                    st.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen if admission == Admission::Trial => {
                warn!(breaker = %self.inner.name, "circuit HALF_OPEN -> OPEN (trial failed)");
                st.state = CircuitState::Open;
                st.failure_count += 1;
                st.trial_in_flight = false;
            }
            // Admitted before the circuit opened; the trial decides.
            CircuitState::HalfOpen | CircuitState::Open => {
                st.failure_count += 1;
            }
        }
    }

    /// Lower the failure count by one if the circuit is closed.
    pub fn decay(&self) {
        let mut st = lock(&self.inner.state);
        if st.state == CircuitState::Closed && st.failure_count > 0 {
            st.failure_count -= 1;
            debug!(
                breaker = %self.inner.name,
                failures = st.failure_count,
                "circuit failure count decayed"
            );
        }
    }

    /// Run the decay loop until the shutdown signal fires.
    pub async fn run_decay(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.monitoring_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.decay(),
                _ = shutdown.changed() => {
                    debug!(breaker = %self.inner.name, "circuit decay loop stopping");
                    break;
                }
            }
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut st = lock(&self.inner.state);
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.last_failure = None;
        st.trial_in_flight = false;
        info!(breaker = %self.inner.name, "circuit manually reset to CLOSED");
    }

    pub fn stats(&self) -> CircuitStats {
        let (state, failure_count) = {
            let st = lock(&self.inner.state);
            (st.state, st.failure_count)
        };
        let successes = self.inner.successes.load(Ordering::Relaxed);
        let failures = self.inner.failures.load(Ordering::Relaxed);
        let executed = successes + failures;
        CircuitStats {
            name: self.inner.name.clone(),
            state,
            failure_count,
            success_count: successes,
            request_count: self.inner.requests.load(Ordering::Relaxed),
            rejected_count: self.inner.rejections.load(Ordering::Relaxed),
            failure_rate: if executed == 0 {
                0.0
            } else {
                failures as f64 / executed as f64
            },
        }
    }
}

/// How a call got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    /// Holds the single half-open trial slot.
    Trial,
}

/// Frees the half-open trial slot if the caller abandons the trial before
/// it settles.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            let mut st = lock(&self.breaker.inner.state);
            if st.state == CircuitState::HalfOpen {
                st.trial_in_flight = false;
            }
        }
    }
}
