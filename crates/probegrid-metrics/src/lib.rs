//! probegrid-metrics: observability for the monitoring engine.
//!
//! Every engine operation reports into a [`MetricsRegistry`] keyed by
//! metric name and tags. Readers take point-in-time snapshots; nothing
//! resets on read.
//!
//! # Architecture
//!
//! ```text
//! MetricsRegistry
//!   ├── increment() / gauge() / record()  ← called by the orchestrator
//!   ├── snapshot() / get()                → read-only MetricSnapshot
//!   └── aggregate_by_tag()                → weighted per-group rollup
//!
//! Prometheus exposition
//!   └── render_prometheus() → text written by the daemon each cycle
//! ```

pub mod prometheus;
pub mod registry;

pub use prometheus::render_prometheus;
pub use registry::{Aggregate, MetricKind, MetricSnapshot, MetricsRegistry};
