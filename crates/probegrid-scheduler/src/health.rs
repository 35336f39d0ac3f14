//! Rolling health of a single target.
//!
//! Keeps the last `capacity` check outcomes plus running counters. A target
//! is healthy while it has fewer than [`UNHEALTHY_FAILURES`] consecutive
//! failures and at least one success in its window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Consecutive failures at which a target stops counting as healthy.
pub const UNHEALTHY_FAILURES: u32 = 3;

/// One recorded check outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSample {
    pub success: bool,
    pub latency: Duration,
    pub at: Instant,
}

/// Bounded outcome history for one target.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    history: VecDeque<HealthSample>,
    capacity: usize,
    consecutive_failures: u32,
    consecutive_successes: u32,
    average_latency: Option<Duration>,
}

impl HealthRecord {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            consecutive_failures: 0,
            consecutive_successes: 0,
            average_latency: None,
        }
    }

    /// Append an outcome, dropping the oldest past capacity.
    pub fn record(&mut self, success: bool, latency: Duration) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(HealthSample {
            success,
            latency,
            at: Instant::now(),
        });

        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
        }
        self.average_latency = self.mean_success_latency();
    }

    /// Mean latency over successful samples only.
    fn mean_success_latency(&self) -> Option<Duration> {
        let (sum, n) = self
            .history
            .iter()
            .filter(|s| s.success)
            .fold((Duration::ZERO, 0u32), |(sum, n), s| (sum + s.latency, n + 1));
        (n > 0).then(|| sum / n)
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_FAILURES && self.history.iter().any(|s| s.success)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Successes in a row since the last failure.
    pub fn healthy_streak(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn average_latency(&self) -> Option<Duration> {
        self.average_latency
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HealthSample> {
        self.history.iter()
    }

    pub fn last_checked(&self) -> Option<Instant> {
        self.history.back().map(|s| s.at)
    }

    /// Fraction of successful samples in the window.
    pub fn success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let ok = self.history.iter().filter(|s| s.success).count();
        ok as f64 / self.history.len() as f64
    }
}

/// Serializable view of a [`HealthRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub healthy_streak: u32,
    pub average_latency_ms: Option<u64>,
    pub success_rate: f64,
    pub samples: usize,
}

impl From<&HealthRecord> for HealthSummary {
    fn from(r: &HealthRecord) -> Self {
        Self {
            healthy: r.is_healthy(),
            consecutive_failures: r.consecutive_failures(),
            healthy_streak: r.healthy_streak(),
            average_latency_ms: r.average_latency().map(|d| d.as_millis() as u64),
            success_rate: r.success_rate(),
            samples: r.len(),
        }
    }
}
