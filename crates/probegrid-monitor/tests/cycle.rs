//! End-to-end monitoring cycles against a scripted probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use probegrid_core::{
    BoxFuture, CheckStatus, MonitorConfig, Priority, Probe, ProbeError, ProbeOutcome, Target,
};
use probegrid_monitor::{InMemoryStore, LogAlertSink, Orchestrator};
use probegrid_scheduler::{DegradationLevel, MonitoringMode};

#[derive(Clone, Copy)]
enum Behavior {
    Up,
    Down,
    Slow(Duration),
}

/// Answers per URL and counts calls.
#[derive(Default)]
struct FleetProbe {
    behavior: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FleetProbe {
    fn new(behavior: &[(&str, Behavior)]) -> Arc<Self> {
        let probe = Self::default();
        *probe.behavior.lock().unwrap() = behavior
            .iter()
            .map(|(url, b)| (url.to_string(), *b))
            .collect();
        Arc::new(probe)
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl Probe for FleetProbe {
    type Context = ();

    fn open(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn probe<'a>(
        &'a self,
        _ctx: &'a mut (),
        target: &'a Target,
    ) -> BoxFuture<'a, Result<ProbeOutcome, ProbeError>> {
        *self.calls.lock().unwrap().entry(target.url.clone()).or_default() += 1;
        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .get(&target.url)
            .copied()
            .unwrap_or(Behavior::Up);
        Box::pin(async move {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = match behavior {
                Behavior::Up => Ok(ProbeOutcome {
                    authorized_count: 3,
                    unauthorized_count: 1,
                    ip: Some("10.1.2.3".into()),
                }),
                Behavior::Down => Err(ProbeError::Transient("connection refused".into())),
                Behavior::Slow(d) => {
                    tokio::time::sleep(d).await;
                    Ok(ProbeOutcome {
                        authorized_count: 0,
                        unauthorized_count: 0,
                        ip: None,
                    })
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn close(&self, _ctx: ()) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn config(targets: Vec<Target>) -> MonitorConfig {
    MonitorConfig {
        retry_attempts: 0,
        failure_threshold: 100,
        interval_minutes: 1,
        targets,
        ..MonitorConfig::default()
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator<FleetProbe>>,
    probe: Arc<FleetProbe>,
    store: Arc<InMemoryStore>,
    alerts: Arc<LogAlertSink>,
}

fn harness(config: MonitorConfig, behavior: &[(&str, Behavior)]) -> Harness {
    let probe = FleetProbe::new(behavior);
    let store = Arc::new(InMemoryStore::with_targets(
        config.targets.iter().map(|t| t.url.as_str()),
    ));
    let alerts = Arc::new(LogAlertSink::new());
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        Arc::clone(&probe),
        store.clone(),
        alerts.clone(),
    ));
    Harness {
        orchestrator,
        probe,
        store,
        alerts,
    }
}

fn fleet() -> Vec<Target> {
    vec![
        Target::new("http://a", "site-a", Priority::High),
        Target::new("http://b", "site-a", Priority::Medium),
        Target::new("http://c", "site-b", Priority::High),
    ]
}

// ── Cycle results ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cycle_records_results_everywhere() {
    let h = harness(
        config(fleet()),
        &[("http://c", Behavior::Down)],
    );
    let report = h.orchestrator.run_cycle().await;

    assert_eq!(report.cycle, 1);
    assert_eq!(report.planned, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.from_cache, 0);

    let a = h.store.register("http://a");
    assert_eq!(h.store.checks(a.id).len(), 1);
    assert_eq!(h.store.status("http://a").unwrap().ip.as_deref(), Some("10.1.2.3"));
    assert_eq!(h.store.status("http://c").unwrap().status, CheckStatus::Offline);
    assert_eq!(h.alerts.last_status("http://c"), Some(CheckStatus::Offline));

    let metrics = h.orchestrator.metrics();
    let online = metrics
        .get("checks", &[("group", "site-a"), ("status", "online")])
        .unwrap();
    assert_eq!(online.value(), 2.0);
    let errors = metrics.get("check_errors", &[("kind", "probe")]).unwrap();
    assert_eq!(errors.value(), 1.0);

    // site-a 100, site-b 0: mean 50 and half the groups healthy.
    assert_eq!(report.mode, MonitoringMode::Reduced);
    assert_eq!(report.level, DegradationLevel::Partial);
}

#[tokio::test(start_paused = true)]
async fn cached_successes_skip_probe_and_failures_are_not_cached() {
    let h = harness(config(fleet()), &[("http://c", Behavior::Down)]);
    h.orchestrator.run_cycle().await;
    let second = h.orchestrator.run_cycle().await;

    assert_eq!(second.succeeded, 2);
    assert_eq!(second.from_cache, 2);
    assert_eq!(second.failed, 1);
    assert_eq!(h.probe.calls("http://a"), 1);
    assert_eq!(h.probe.calls("http://c"), 2);

    // Cache hits are not persisted again.
    let a = h.store.register("http://a");
    assert_eq!(h.store.checks(a.id).len(), 1);
    let cache = h.orchestrator.cache().unwrap();
    assert!(cache.get("http://c").is_none());
}

#[tokio::test(start_paused = true)]
async fn cache_disabled_probes_every_cycle() {
    let mut cfg = config(fleet());
    cfg.enable_cache = false;
    let h = harness(cfg, &[]);
    h.orchestrator.run_cycle().await;
    let second = h.orchestrator.run_cycle().await;
    assert_eq!(second.from_cache, 0);
    assert_eq!(h.probe.calls("http://a"), 2);
    assert!(h.orchestrator.status().cache.is_none());
}

// ── Failure handling ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn open_circuit_rejections_leave_health_alone() {
    let mut cfg = config(vec![Target::new("http://down", "site", Priority::High)]);
    cfg.failure_threshold = 1;
    let h = harness(cfg, &[("http://down", Behavior::Down)]);

    h.orchestrator.run_cycle().await;
    let second = h.orchestrator.run_cycle().await;

    assert_eq!(second.failed, 1);
    assert_eq!(second.circuit_rejected, 1);
    assert_eq!(h.probe.calls("http://down"), 1);
    let health = h.orchestrator.scheduler().health("http://down").unwrap();
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(health.samples, 1);
    assert_eq!(
        h.store.status("http://down").unwrap().status,
        CheckStatus::Offline
    );
}

#[tokio::test(start_paused = true)]
async fn store_outage_does_not_fail_checks() {
    let h = harness(config(fleet()), &[]);
    h.store.set_unavailable(true);
    let report = h.orchestrator.run_cycle().await;
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
}

// ── Scheduling ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn critical_degradation_checks_only_high_priority() {
    let targets = vec![
        Target::new("http://core", "site-a", Priority::High),
        Target::new("http://edge", "site-b", Priority::Low),
    ];
    let h = harness(
        config(targets),
        &[("http://core", Behavior::Down), ("http://edge", Behavior::Down)],
    );

    let first = h.orchestrator.run_cycle().await;
    assert_eq!(first.mode, MonitoringMode::Emergency);
    assert_eq!(first.level, DegradationLevel::Critical);

    let second = h.orchestrator.run_cycle().await;
    assert_eq!(second.planned, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.probe.calls("http://core"), 2);
    assert_eq!(h.probe.calls("http://edge"), 1);
    // Skipped targets are not penalised.
    let edge = h.orchestrator.scheduler().health("http://edge").unwrap();
    assert_eq!(edge.samples, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_targets_are_not_checked() {
    let h = harness(config(fleet()), &[]);
    assert!(h.orchestrator.scheduler().set_enabled("http://b", false));
    let report = h.orchestrator.run_cycle().await;
    assert_eq!(report.targets, 2);
    assert_eq!(report.planned, 2);
    assert_eq!(h.probe.calls("http://b"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_stays_within_limit() {
    let targets: Vec<Target> = (0..6)
        .map(|i| Target::new(format!("http://slow-{i}"), "site", Priority::Medium))
        .collect();
    let behavior: Vec<(String, Behavior)> = targets
        .iter()
        .map(|t| (t.url.clone(), Behavior::Slow(Duration::from_secs(2))))
        .collect();
    let behavior: Vec<(&str, Behavior)> =
        behavior.iter().map(|(u, b)| (u.as_str(), *b)).collect();
    let mut cfg = config(targets);
    cfg.concurrency_limit = 2;
    let h = harness(cfg, &behavior);

    let report = h.orchestrator.run_cycle().await;
    assert_eq!(report.succeeded, 6);
    assert_eq!(h.probe.peak.load(Ordering::SeqCst), 2);
    assert_eq!(h.orchestrator.limiter().stats().peak_active, 2);
}

#[tokio::test(start_paused = true)]
async fn stopped_orchestrator_starts_no_checks() {
    let h = harness(config(fleet()), &[]);
    h.orchestrator.stop_accepting();
    let report = h.orchestrator.run_cycle().await;
    assert_eq!(report.cancelled, 3);
    assert_eq!(report.succeeded, 0);
    assert_eq!(h.probe.calls("http://a"), 0);
}

// ── Run loop ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn run_waits_interval_between_cycles() {
    let h = harness(config(fleet()), &[]);
    let mut reports = h.orchestrator.subscribe();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.orchestrator).run(rx));

    let start = Instant::now();
    assert_eq!(reports.recv().await.unwrap().cycle, 1);
    assert_eq!(reports.recv().await.unwrap().cycle, 2);
    assert!(start.elapsed() >= Duration::from_secs(60));

    tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(h.orchestrator.last_report().unwrap().cycle, 2);
}

#[tokio::test(start_paused = true)]
async fn status_snapshot_reports_every_component() {
    let h = harness(config(fleet()), &[("http://c", Behavior::Down)]);
    h.orchestrator.run_cycle().await;

    let status = h.orchestrator.status();
    assert_eq!(status.cycles, 1);
    assert_eq!(status.pool.capacity, 5);
    assert_eq!(status.limiter.completed, 3);
    assert_eq!(status.scheduler.groups.len(), 2);
    assert!(status.latency_by_group.contains_key("site-a"));
    assert!(!status.latency_by_group.contains_key("site-b"));

    let json = status.to_json().unwrap();
    assert!(json.contains("\"mode\""));
    let text = status.to_prometheus();
    assert!(text.contains("probegrid_checks_total"));
}
