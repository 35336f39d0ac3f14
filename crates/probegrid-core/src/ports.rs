//! Collaborator ports: the traits the monitor drives but does not implement.
//!
//! The probe does the actual network work against a target, the store
//! persists check history, and the alert sink raises or clears alerts.
//! None of them carry retry or failure-handling logic; that lives in the
//! engine around them.

use std::future::Future;
use std::pin::Pin;

use crate::error::{ProbeError, StoreError};
use crate::types::{CheckResult, CheckStatus, ProbeOutcome, Target};

/// Boxed, sendable future returned by port methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Performs a check against a target using a pooled execution context.
///
/// Contexts are expensive to create (connections, sessions) and are
/// reused across checks through the resource pool. A probe that finds its
/// context broken returns [`ProbeError::Disconnected`].
pub trait Probe: Send + Sync + 'static {
    /// Reusable execution context.
    type Context: Send + 'static;

    /// Create a fresh execution context.
    fn open(&self) -> BoxFuture<'_, anyhow::Result<Self::Context>>;

    /// Probe a target.
    fn probe<'a>(
        &'a self,
        ctx: &'a mut Self::Context,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<ProbeOutcome, ProbeError>>;

    /// Release a context. Failures are logged by the caller, not propagated.
    fn close(&self, ctx: Self::Context) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Stored identity of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTarget {
    pub id: u64,
    pub url: String,
}

/// Persistence collaborator.
pub trait Store: Send + Sync + 'static {
    fn get_target<'a>(&'a self, url: &'a str)
    -> BoxFuture<'a, Result<Option<StoredTarget>, StoreError>>;

    fn record_check<'a>(
        &'a self,
        target_id: u64,
        result: &'a CheckResult,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn update_status<'a>(
        &'a self,
        url: &'a str,
        status: CheckStatus,
        ip: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Alerting collaborator, invoked once per completed check.
pub trait AlertSink: Send + Sync + 'static {
    fn on_check_result<'a>(&'a self, result: &'a CheckResult) -> BoxFuture<'a, ()>;
}
