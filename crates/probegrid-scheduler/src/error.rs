//! Scheduler error types.

use thiserror::Error;

/// Errors returned by the concurrency limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("concurrency limiter is closed to new work")]
    Closed,
}

pub type LimiterResult<T> = Result<T, LimiterError>;
