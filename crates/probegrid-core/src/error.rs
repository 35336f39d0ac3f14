//! Error types shared across probegrid crates.

use thiserror::Error;

/// Result type alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup only; a running monitor never produces them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Errors raised by a probe.
///
/// The engine does not classify these for retry purposes; every variant is
/// retried the same way. `Disconnected` additionally marks the execution
/// context the probe ran on as unusable so the pool evicts it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// Network or site failure.
    #[error("probe failed: {0}")]
    Transient(String),

    /// The execution context is broken (e.g. connection closed).
    #[error("probe context disconnected: {0}")]
    Disconnected(String),
}

impl ProbeError {
    /// Whether the context that produced this error must be evicted.
    pub fn is_structural(&self) -> bool {
        matches!(self, ProbeError::Disconnected(_))
    }
}

/// Errors raised by a store.
///
/// Always recovered locally by the caller (logged); never fails a check.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target not found: {0}")]
    NotFound(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
