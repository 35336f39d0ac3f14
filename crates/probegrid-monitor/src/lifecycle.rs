//! Start/stop controller for the whole engine.
//!
//! [`Monitor::start`] spawns the cycle loop and every background timer on
//! one shutdown channel. [`Monitor::stop`] refuses new checks and signals
//! shutdown. It then abandons checks in flight and closes the pooled
//! execution contexts, waits for the limiter to drain and joins every task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use probegrid_core::{AlertSink, MonitorConfig, Probe, Store};

use crate::memory::MemoryMonitor;
use crate::orchestrator::Orchestrator;
use crate::status::StatusSnapshot;

/// Owns the orchestrator, the memory watchdog and their tasks.
pub struct Monitor<P: Probe> {
    orchestrator: Arc<Orchestrator<P>>,
    memory: Arc<MemoryMonitor>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl<P: Probe> Monitor<P> {
    /// Build the engine from configuration, watching this process's memory.
    pub fn new(
        config: &MonitorConfig,
        probe: Arc<P>,
        store: Arc<dyn Store>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::with_parts(
            Orchestrator::new(config, probe, store, alerts),
            MemoryMonitor::for_current_process(
                config.memory_threshold_bytes(),
                config.memory_check_period(),
            ),
        )
    }

    pub fn with_parts(orchestrator: Orchestrator<P>, memory: MemoryMonitor) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            orchestrator: Arc::new(orchestrator),
            memory: Arc::new(memory),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<P>> {
        &self.orchestrator
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    pub fn status(&self) -> StatusSnapshot {
        self.orchestrator.status()
    }

    /// Fires when [`Monitor::stop`] begins, for tasks owned by the caller.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.shutdown.borrow()
    }

    /// Spawn the cycle loop and background timers. Only the first call has
    /// any effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("monitor already started");
            return;
        }

        let mut tasks = Vec::new();

        let orchestrator = Arc::clone(&self.orchestrator);
        let rx = self.shutdown.subscribe();
        tasks.push(("orchestrator", tokio::spawn(orchestrator.run(rx))));

        if let Some(cache) = self.orchestrator.cache() {
            let cache = cache.clone();
            let rx = self.shutdown.subscribe();
            tasks.push((
                "cache-sweeper",
                tokio::spawn(async move { cache.run_sweeper(rx).await }),
            ));
        }

        let breaker = self.orchestrator.executor().breaker().clone();
        let rx = self.shutdown.subscribe();
        tasks.push((
            "circuit-decay",
            tokio::spawn(async move { breaker.run_decay(rx).await }),
        ));

        let memory = Arc::clone(&self.memory);
        let rx = self.shutdown.subscribe();
        tasks.push((
            "memory-monitor",
            tokio::spawn(async move { memory.run(rx).await }),
        ));

        let pressure = self.memory.subscribe();
        let orchestrator = Arc::clone(&self.orchestrator);
        let rx = self.shutdown.subscribe();
        tasks.push((
            "pressure-responder",
            tokio::spawn(respond_to_pressure(orchestrator, pressure, rx)),
        ));

        info!(tasks = tasks.len(), "monitor started");
        *self.tasks() = tasks;
    }

    /// Stop everything and wait for it. Safe to call more than once.
    pub async fn stop(&self) {
        if *self.shutdown.borrow() {
            debug!("monitor already stopping");
            return;
        }
        info!("monitor stopping");

        self.orchestrator.stop_accepting();
        self.orchestrator.limiter().close();
        self.shutdown.send_replace(true);
        self.orchestrator.executor().shutdown().await;

        self.orchestrator.limiter().wait_for_drain().await;
        debug!("in-flight checks drained");

        let tasks = std::mem::take(&mut *self.tasks());
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "background task failed");
            }
        }
        info!(
            cycles = self.orchestrator.status().cycles,
            "monitor stopped"
        );
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, JoinHandle<()>)>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clear the result cache whenever memory pressure is reported.
async fn respond_to_pressure<P: Probe>(
    orchestrator: Arc<Orchestrator<P>>,
    mut pressure: broadcast::Receiver<crate::memory::MemoryPressure>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = pressure.recv() => match event {
                Ok(p) => {
                    if let Some(cache) = orchestrator.cache() {
                        let entries = cache.len();
                        cache.clear();
                        warn!(
                            resident_mb = p.resident_bytes / (1024 * 1024),
                            entries,
                            "memory pressure, result cache cleared"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "pressure events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
