//! Process memory watchdog.
//!
//! Samples this process's resident memory on a fixed period and publishes
//! a [`MemoryPressure`] event whenever it is above the threshold. The
//! lifecycle controller responds by clearing the result cache.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Source of the current resident memory, in bytes.
pub trait MemorySource: Send + 'static {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads this process's resident set size through `sysinfo`.
pub struct ProcessMemory {
    system: System,
    pid: Pid,
}

impl ProcessMemory {
    pub fn current() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl MemorySource for ProcessMemory {
    fn resident_bytes(&mut self) -> Option<u64> {
        let _ = self
            .system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);
        self.system.process(self.pid).map(|p| p.memory())
    }
}

/// Published when resident memory exceeds the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryPressure {
    pub resident_bytes: u64,
    pub threshold_bytes: u64,
}

/// Periodic memory check with a typed subscription point.
pub struct MemoryMonitor {
    source: Mutex<Box<dyn MemorySource>>,
    threshold_bytes: u64,
    period: Duration,
    events: broadcast::Sender<MemoryPressure>,
}

impl MemoryMonitor {
    /// Watch this process.
    pub fn for_current_process(threshold_bytes: u64, period: Duration) -> Self {
        Self::new(ProcessMemory::current(), threshold_bytes, period)
    }

    pub fn new(source: impl MemorySource, threshold_bytes: u64, period: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            source: Mutex::new(Box::new(source)),
            threshold_bytes,
            period,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryPressure> {
        self.events.subscribe()
    }

    fn source(&self) -> MutexGuard<'_, Box<dyn MemorySource>> {
        self.source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sample once, publishing pressure if over the threshold.
    pub fn check(&self) -> Option<MemoryPressure> {
        let Some(resident_bytes) = self.source().resident_bytes() else {
            debug!("resident memory unavailable");
            return None;
        };
        if resident_bytes <= self.threshold_bytes {
            return None;
        }
        let pressure = MemoryPressure {
            resident_bytes,
            threshold_bytes: self.threshold_bytes,
        };
        warn!(
            resident_mb = resident_bytes / (1024 * 1024),
            threshold_mb = self.threshold_bytes / (1024 * 1024),
            "memory pressure"
        );
        let _ = self.events.send(pressure);
        Some(pressure)
    }

    /// Check every period until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check();
                }
                _ = shutdown.changed() => {
                    debug!("memory monitor stopping");
                    break;
                }
            }
        }
    }
}
