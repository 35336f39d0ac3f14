//! probegrid-core: shared vocabulary for the probegrid fleet monitor.
//!
//! Everything the resilience engine passes between its layers lives here:
//! targets and their priorities, check results, the TOML configuration,
//! the error taxonomy, and the traits implemented by the collaborators the
//! engine drives (probe, store, alert sink).

pub mod config;
pub mod error;
pub mod ports;
pub mod types;

pub use config::MonitorConfig;
pub use error::{ConfigError, ConfigResult, ProbeError, StoreError};
pub use ports::{AlertSink, BoxFuture, Probe, Store, StoredTarget};
pub use types::*;
