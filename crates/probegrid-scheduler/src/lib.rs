//! probegrid-scheduler: decides what runs, and how much runs at once.
//!
//! - [`ConcurrencyLimiter`] bounds in-flight checks and admits queued work
//!   by priority, then arrival order.
//! - [`HealthRecord`] keeps the rolling outcome window of one target.
//! - [`AdaptiveScheduler`] turns per-target and per-group health into a
//!   [`MonitoringMode`] and a [`DegradationLevel`], and filters each
//!   cycle's targets through both.

pub mod adaptive;
pub mod error;
pub mod health;
pub mod limiter;

pub use adaptive::{
    AdaptiveScheduler, DegradationLevel, GroupSnapshot, MonitoringMode, SchedulerConfig,
    SchedulerSnapshot, SchedulerState,
};
pub use error::{LimiterError, LimiterResult};
pub use health::{HealthRecord, HealthSample, HealthSummary, UNHEALTHY_FAILURES};
pub use limiter::{ConcurrencyLimiter, LimiterStats, Permit, Ticket};
