//! One check against one target, wrapped in every resilience layer.
//!
//! ```text
//! CircuitBreaker::call
//!   └── ResourcePool::acquire        ResourceTimeout fails the call, no retry
//!         └── RetryPolicy::execute
//!               └── with_timeout
//!                     └── Probe::probe(context, target)
//! ```
//!
//! The leased context is kept across attempts. A structural probe error
//! or a timed-out attempt evicts it and the next attempt leases a fresh
//! one. If that lease fails the check ends there.
//!
//! [`CheckExecutor::shutdown`] abandons every check still in flight with
//! [`CheckError::Shutdown`] before closing the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use probegrid_core::{BoxFuture, MonitorConfig, Probe, ProbeError, ProbeOutcome, Target};
use probegrid_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, PoolConfig, PoolError, PoolGuard,
    ResourceFactory, ResourcePool, RetryPolicy, TimeoutExceeded, with_timeout,
};

/// Why a check produced no outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("probe {0}")]
    Timeout(#[from] TimeoutExceeded),

    #[error("no execution context available after {}ms", .0.as_millis())]
    ResourceTimeout(Duration),

    #[error("execution context could not be opened: {0}")]
    Context(String),

    #[error("execution context pool is shut down")]
    PoolClosed,

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("monitor is shutting down")]
    Shutdown,
}

impl CheckError {
    /// Rejected by the breaker without touching the probe.
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, CheckError::CircuitOpen(_))
    }

    /// Leasing failed, so another attempt would only wait on the pool again.
    fn ends_retries(&self) -> bool {
        matches!(
            self,
            CheckError::ResourceTimeout(_) | CheckError::PoolClosed | CheckError::Shutdown
        )
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::Probe(ProbeError::Transient(_)) => "probe",
            CheckError::Probe(ProbeError::Disconnected(_)) => "disconnected",
            CheckError::Timeout(_) => "timeout",
            CheckError::ResourceTimeout(_) => "resource_timeout",
            CheckError::Context(_) => "context",
            CheckError::PoolClosed => "pool_closed",
            CheckError::CircuitOpen(_) => "circuit_open",
            CheckError::Shutdown => "shutdown",
        }
    }
}

impl From<PoolError> for CheckError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ResourceTimeout(d) => CheckError::ResourceTimeout(d),
            PoolError::Closed => CheckError::PoolClosed,
            PoolError::Create(msg) => CheckError::Context(msg),
        }
    }
}

impl From<CircuitError<CheckError>> for CheckError {
    fn from(e: CircuitError<CheckError>) -> Self {
        match e {
            CircuitError::Open(name) => CheckError::CircuitOpen(name),
            CircuitError::Inner(e) => e,
        }
    }
}

/// Pools a probe's execution contexts.
pub struct ProbeContexts<P: Probe>(Arc<P>);

impl<P: Probe> ResourceFactory for ProbeContexts<P> {
    type Resource = P::Context;

    fn create(&self) -> BoxFuture<'_, anyhow::Result<P::Context>> {
        self.0.open()
    }

    fn close(&self, ctx: P::Context) -> BoxFuture<'_, anyhow::Result<()>> {
        self.0.close(ctx)
    }
}

pub type ContextPool<P> = ResourcePool<ProbeContexts<P>>;

/// Result of [`CheckExecutor::check`].
#[derive(Debug)]
pub struct CheckOutcome {
    pub result: Result<ProbeOutcome, CheckError>,
    /// Probe attempts made; 0 when rejected before probing.
    pub attempts: u32,
}

/// Runs checks through the breaker, pool, retry and timeout layers.
pub struct CheckExecutor<P: Probe> {
    probe: Arc<P>,
    pool: ContextPool<P>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: watch::Sender<bool>,
}

impl<P: Probe> CheckExecutor<P> {
    pub fn new(
        probe: Arc<P>,
        pool: PoolConfig,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            pool: ResourcePool::new(ProbeContexts(Arc::clone(&probe)), pool),
            probe,
            breaker,
            retry,
            timeout,
            cancel,
        }
    }

    pub fn from_config(probe: Arc<P>, config: &MonitorConfig) -> Self {
        Self::new(
            probe,
            PoolConfig {
                max_resources: config.pool_max_resources,
                acquire_timeout: config.pool_wait_timeout(),
            },
            CircuitBreaker::new(
                "probe",
                CircuitBreakerConfig {
                    failure_threshold: config.failure_threshold,
                    reset_timeout: config.circuit_reset_timeout(),
                    monitoring_period: config.circuit_decay_period(),
                },
            ),
            RetryPolicy::new(config.retry_attempts, config.retry_base_delay())
                .with_multiplier(config.retry_backoff_multiplier),
            config.probe_timeout(),
        )
    }

    pub fn pool(&self) -> &ContextPool<P> {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Check `target` once through every layer.
    pub async fn check(&self, target: &Target) -> CheckOutcome {
        let mut cancelled = self.cancel.subscribe();
        let probes = AtomicU32::new(0);
        let result = tokio::select! {
            biased;
            _ = cancelled.wait_for(|stop| *stop) => Err(CheckError::Shutdown),
            r = self.breaker.call(|| self.leased_attempts(target, &probes)) => {
                r.map_err(CheckError::from)
            }
        };
        CheckOutcome {
            result,
            attempts: probes.load(Ordering::Relaxed),
        }
    }

    async fn leased_attempts(
        &self,
        target: &Target,
        probes: &AtomicU32,
    ) -> Result<ProbeOutcome, CheckError> {
        let lease = Mutex::new(Some(self.pool.acquire().await?));

        self.retry
            .execute_unless(
                |attempt| self.attempt(target, &lease, probes, attempt),
                CheckError::ends_retries,
            )
            .await
            .result
    }

    async fn attempt(
        &self,
        target: &Target,
        lease: &Mutex<Option<PoolGuard<ProbeContexts<P>>>>,
        probes: &AtomicU32,
        attempt: u32,
    ) -> Result<ProbeOutcome, CheckError> {
        let mut slot = lease.lock().await;
        if slot.is_none() {
            *slot = Some(self.pool.acquire().await?);
        }
        let Some(guard) = slot.as_mut() else {
            return Err(CheckError::PoolClosed);
        };

        probes.fetch_add(1, Ordering::Relaxed);
        let result = with_timeout(self.timeout, self.probe.probe(&mut **guard, target)).await;
        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                if e.is_structural() {
                    if let Some(broken) = slot.take() {
                        broken.evict();
                    }
                }
                debug!(target_url = %target.url, attempt, error = %e, "probe attempt failed");
                Err(e.into())
            }
            Err(elapsed) => {
                // The context may hold a half-finished exchange.
                if let Some(stale) = slot.take() {
                    stale.evict();
                }
                warn!(target_url = %target.url, attempt, timeout_ms = self.timeout.as_millis() as u64, "probe attempt timed out");
                Err(elapsed.into())
            }
        }
    }

    /// Abandon checks in flight, fail pool waiters and close every
    /// pooled context.
    pub async fn shutdown(&self) {
        self.cancel.send_replace(true);
        self.pool.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.cancel.borrow()
    }
}
