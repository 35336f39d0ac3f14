//! Monitoring cycle driver.
//!
//! Each cycle plans targets through the adaptive scheduler, reserves a
//! limiter place for each in plan order, and runs every admitted check on
//! its own task. A cached result short-circuits the resilience stack. All
//! checks are awaited together; a failed check never aborts the cycle.
//! The next cycle starts `interval` after the previous one finished.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use probegrid_cache::{CacheConfig, ResultCache};
use probegrid_core::{AlertSink, CheckResult, MonitorConfig, Probe, Store, Target};
use probegrid_metrics::MetricsRegistry;
use probegrid_scheduler::{
    AdaptiveScheduler, ConcurrencyLimiter, DegradationLevel, MonitoringMode, SchedulerConfig,
};

use crate::check::{CheckError, CheckExecutor, CheckOutcome};
use crate::status::StatusSnapshot;

/// Summary of one monitoring cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Enabled targets at the start of the cycle.
    pub targets: usize,
    /// Targets that passed the scheduler filters.
    pub planned: usize,
    /// Enabled targets filtered out by mode or degradation level.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes served from the result cache.
    pub from_cache: usize,
    /// Failures rejected by an open circuit.
    pub circuit_rejected: usize,
    /// Checks dropped because the monitor was stopping.
    pub cancelled: usize,
    pub duration_ms: u64,
    pub mode: MonitoringMode,
    pub level: DegradationLevel,
}

struct Checked {
    result: CheckResult,
    circuit_rejected: bool,
}

/// Drives monitoring cycles over the configured targets.
pub struct Orchestrator<P: Probe> {
    scheduler: AdaptiveScheduler,
    limiter: ConcurrencyLimiter,
    cache: Option<ResultCache<CheckResult>>,
    executor: CheckExecutor<P>,
    metrics: MetricsRegistry,
    store: Arc<dyn Store>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    accepting: AtomicBool,
    cycles: AtomicU64,
    last_report: Mutex<Option<CycleReport>>,
    reports: broadcast::Sender<CycleReport>,
}

impl<P: Probe> Orchestrator<P> {
    pub fn new(
        config: &MonitorConfig,
        probe: Arc<P>,
        store: Arc<dyn Store>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let cache = config.enable_cache.then(|| {
            ResultCache::new(CacheConfig {
                ttl: config.cache_ttl(),
                max_size: config.cache_max_size,
                sweep_interval: config.cache_sweep_period(),
            })
        });
        let (reports, _) = broadcast::channel(16);
        Self {
            scheduler: AdaptiveScheduler::new(
                SchedulerConfig {
                    history_size: config.history_size,
                },
                config.targets.iter().cloned(),
            ),
            limiter: ConcurrencyLimiter::new(config.concurrency_limit),
            cache,
            executor: CheckExecutor::from_config(probe, config),
            metrics: MetricsRegistry::new(config.metrics_max_samples),
            store,
            alerts,
            interval: config.cycle_interval(),
            accepting: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
            last_report: Mutex::new(None),
            reports,
        }
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> Option<&ResultCache<CheckResult>> {
        self.cache.as_ref()
    }

    pub fn executor(&self) -> &CheckExecutor<P> {
        &self.executor
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Receive a report after every cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Stop starting new checks. Checks in flight end once the executor
    /// shuts down.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run cycles until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            targets = self.scheduler.targets().len(),
            "orchestrator started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(cycles = self.cycles.load(Ordering::Relaxed), "orchestrator stopped");
    }

    /// Run one monitoring cycle and wait for every check in it.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let enabled = self.scheduler.targets().iter().filter(|t| t.enabled).count();
        let planned = self.scheduler.plan_cycle();

        let mut report = CycleReport {
            cycle,
            targets: enabled,
            planned: planned.len(),
            skipped: enabled.saturating_sub(planned.len()),
            succeeded: 0,
            failed: 0,
            from_cache: 0,
            circuit_rejected: 0,
            cancelled: 0,
            duration_ms: 0,
            mode: MonitoringMode::Normal,
            level: DegradationLevel::Normal,
        };
        debug!(cycle, planned = report.planned, skipped = report.skipped, "cycle starting");

        let mut jobs = JoinSet::new();
        for target in planned {
            let ticket = match self.limiter.reserve(target.priority) {
                Ok(ticket) => ticket,
                Err(e) => {
                    debug!(target_url = %target.url, error = %e, "check not admitted");
                    report.cancelled += 1;
                    continue;
                }
            };
            let this = Arc::clone(self);
            jobs.spawn(async move {
                let Ok(_permit) = ticket.admitted().await else {
                    return None;
                };
                this.run_check(&target).await
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(Some(checked)) if checked.result.is_online() => {
                    report.succeeded += 1;
                    if checked.result.from_cache {
                        report.from_cache += 1;
                    }
                }
                Ok(Some(checked)) => {
                    report.failed += 1;
                    if checked.circuit_rejected {
                        report.circuit_rejected += 1;
                    }
                }
                Ok(None) => report.cancelled += 1,
                Err(e) => {
                    error!(cycle, error = %e, "check task failed");
                    report.failed += 1;
                }
            }
        }

        let state = self.scheduler.state();
        report.mode = state.mode;
        report.level = state.level;
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.record_cycle_metrics(&report);

        info!(
            cycle,
            succeeded = report.succeeded,
            failed = report.failed,
            from_cache = report.from_cache,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            mode = %report.mode,
            level = %report.level,
            "cycle complete"
        );

        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        let _ = self.reports.send(report.clone());
        report
    }

    /// Check one target. `None` if the monitor stopped before it finished.
    pub async fn check_target(&self, target: &Target) -> Option<CheckResult> {
        self.run_check(target).await.map(|checked| checked.result)
    }

    async fn run_check(&self, target: &Target) -> Option<Checked> {
        if !self.is_accepting() {
            return None;
        }

        if let Some(hit) = self.cached(target) {
            self.alerts.on_check_result(&hit).await;
            return Some(Checked {
                result: hit,
                circuit_rejected: false,
            });
        }

        let started = Instant::now();
        let CheckOutcome { result, attempts } = self.executor.check(target).await;
        if matches!(result, Err(CheckError::Shutdown)) {
            debug!(target_url = %target.url, attempts, "check abandoned for shutdown");
            return None;
        }
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let circuit_rejected = result.as_ref().is_err_and(CheckError::is_circuit_rejection);
        let result = match result {
            Ok(outcome) => {
                let result = CheckResult::online(target, outcome, latency_ms, attempts);
                if let Some(cache) = &self.cache {
                    cache.set(target.url.clone(), result.clone());
                }
                self.scheduler.record_outcome(&target.url, true, latency);
                self.metrics.record(
                    "check_latency_ms",
                    &[("group", target.group.as_str()), ("target", target.url.as_str())],
                    latency_ms as f64,
                );
                result
            }
            Err(e) => {
                if let Some(cache) = &self.cache {
                    cache.invalidate(&target.url);
                }
                // No attempt was made; leave health as it was.
                if !e.is_circuit_rejection() {
                    self.scheduler.record_outcome(&target.url, false, latency);
                }
                self.metrics.increment("check_errors", &[("kind", e.kind())], 1);
                warn!(
                    target_url = %target.url,
                    group = %target.group,
                    attempts,
                    error = %e,
                    "check failed"
                );
                CheckResult::offline(target, e.to_string(), latency_ms, attempts)
            }
        };

        self.metrics.increment(
            "checks",
            &[("group", target.group.as_str()), ("status", result.status.as_str())],
            1,
        );
        self.metrics
            .record("check_attempts", &[("group", target.group.as_str())], attempts as f64);

        self.persist(&result).await;
        self.alerts.on_check_result(&result).await;
        Some(Checked {
            result,
            circuit_rejected,
        })
    }

    fn cached(&self, target: &Target) -> Option<CheckResult> {
        let mut hit = self.cache.as_ref()?.get(&target.url)?;
        hit.from_cache = true;
        hit.attempts = 0;
        self.metrics
            .increment("cache_hits", &[("group", target.group.as_str())], 1);
        debug!(target_url = %target.url, "served from cache");
        Some(hit)
    }

    /// Store failures are logged and never fail the check.
    async fn persist(&self, result: &CheckResult) {
        match self.store.get_target(&result.url).await {
            Ok(Some(stored)) => {
                if let Err(e) = self.store.record_check(stored.id, result).await {
                    warn!(target_url = %result.url, error = %e, "failed to record check");
                }
            }
            Ok(None) => debug!(target_url = %result.url, "target not in store, check not recorded"),
            Err(e) => warn!(target_url = %result.url, error = %e, "failed to look up target"),
        }
        if let Err(e) = self
            .store
            .update_status(&result.url, result.status, result.ip())
            .await
        {
            warn!(target_url = %result.url, error = %e, "failed to update target status");
        }
    }

    fn record_cycle_metrics(&self, report: &CycleReport) {
        let m = &self.metrics;
        m.increment("cycles", &[], 1);
        m.record("cycle_duration_ms", &[], report.duration_ms as f64);
        m.gauge("cycle_succeeded", &[], report.succeeded as f64);
        m.gauge("cycle_failed", &[], report.failed as f64);
        m.gauge("cycle_skipped", &[], report.skipped as f64);

        let pool = self.executor.pool().stats();
        m.gauge("pool_size", &[], pool.size as f64);
        m.gauge("pool_capacity", &[], pool.capacity as f64);
        let breaker = self.executor.breaker().stats();
        m.gauge("circuit_failure_count", &[("breaker", breaker.name.as_str())], breaker.failure_count as f64);
        if let Some(cache) = &self.cache {
            let stats = cache.stats();
            m.gauge("cache_size", &[], stats.size as f64);
            m.gauge("cache_hit_rate", &[], stats.hit_rate);
        }
    }

    /// Read-only view of every component.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            pool: self.executor.pool().stats(),
            cache: self.cache.as_ref().map(ResultCache::stats),
            circuit: self.executor.breaker().stats(),
            limiter: self.limiter.stats(),
            scheduler: self.scheduler.snapshot(),
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle: self.last_report(),
            latency_by_group: self.metrics.aggregate_by_tag("check_latency_ms", "group"),
            metrics: self.metrics.snapshot(),
        }
    }
}
