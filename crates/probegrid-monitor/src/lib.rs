//! probegrid-monitor: the monitoring engine.
//!
//! # Architecture
//!
//! ```text
//! Monitor (lifecycle)
//!   ├── Orchestrator::run           one cycle per interval
//!   │     ├── AdaptiveScheduler     which targets this cycle
//!   │     ├── ConcurrencyLimiter    how many at once, by priority
//!   │     ├── ResultCache           short-circuit recent successes
//!   │     └── CheckExecutor         breaker → pool → retry → timeout → probe
//!   ├── ResultCache::run_sweeper
//!   ├── CircuitBreaker::run_decay
//!   ├── MemoryMonitor::run          pressure clears the cache
//!   └── stop(): refuse work, signal, drain, join, close contexts
//! ```

pub mod check;
pub mod lifecycle;
pub mod memory;
pub mod orchestrator;
pub mod status;
pub mod store;

pub use check::{CheckError, CheckExecutor, CheckOutcome, ContextPool, ProbeContexts};
pub use lifecycle::Monitor;
pub use memory::{MemoryMonitor, MemoryPressure, MemorySource, ProcessMemory};
pub use orchestrator::{CycleReport, Orchestrator};
pub use status::StatusSnapshot;
pub use store::{InMemoryStore, LogAlertSink, StatusRecord};
