//! probegrid-resilience: the failure-handling layers wrapped around a probe.
//!
//! # Architecture
//!
//! ```text
//! CircuitBreaker::call            fail fast while OPEN
//!   └── RetryPolicy::execute      up to max_retries + 1 attempts, 1.5x backoff
//!         └── with_timeout        per-attempt deadline, op abandoned on expiry
//!               └── PoolGuard     execution context leased from ResourcePool
//! ```
//!
//! Every layer is independent and usable on its own. Shared state (breaker
//! counters, pool slots) is guarded by short synchronous critical sections
//! so release paths can run from `Drop`.

pub mod circuit_breaker;
pub mod pool;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
};
pub use pool::{PoolConfig, PoolError, PoolGuard, PoolStats, ResourceFactory, ResourcePool};
pub use retry::{RetryOutcome, RetryPolicy};
pub use timeout::{TimeoutExceeded, with_timeout};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
