//! Read-only view of the whole engine, for `probegridd status` and the
//! metrics textfile.

use std::collections::BTreeMap;

use serde::Serialize;

use probegrid_cache::CacheStats;
use probegrid_metrics::{Aggregate, MetricSnapshot, render_prometheus};
use probegrid_resilience::{CircuitStats, PoolStats};
use probegrid_scheduler::{LimiterStats, SchedulerSnapshot};

use crate::orchestrator::CycleReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub pool: PoolStats,
    /// `None` when caching is disabled.
    pub cache: Option<CacheStats>,
    pub circuit: CircuitStats,
    pub limiter: LimiterStats,
    pub scheduler: SchedulerSnapshot,
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    /// Check latency aggregated per group.
    pub latency_by_group: BTreeMap<String, Aggregate>,
    #[serde(skip)]
    pub metrics: Vec<MetricSnapshot>,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_prometheus(&self) -> String {
        render_prometheus(&self.metrics)
    }
}
