//! Retry with exponential backoff.
//!
//! Every failure is retried the same way; the policy does not inspect the
//! error. The delay after failed attempt `n` (0-based) is
//! `base_delay * multiplier^n`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
        }
    }
}

/// Result of [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The first success, or the error of the final attempt.
    pub result: Result<T, E>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay to wait after failed attempt `attempt` (0-based). Saturates
    /// at `Duration::MAX`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// `op` receives the 0-based attempt number. No delay follows the final
    /// attempt.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_unless(op, |_| false).await
    }

    /// Like [`execute`](Self::execute), but an error for which `give_up`
    /// holds ends the run at once, with no backoff and no further attempts.
    pub async fn execute_unless<F, Fut, T, E, G>(&self, mut op: F, give_up: G) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        G: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) if give_up(&err) => {
                    debug!(attempt, error = %err, "attempt failed, not retrying");
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) if attempt >= self.max_retries => {
                    warn!(attempts = attempt + 1, error = %err, "retries exhausted");
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
