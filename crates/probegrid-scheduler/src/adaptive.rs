//! Health-driven target selection.
//!
//! Two independent filters run before a target is admitted:
//!
//! - **Monitoring mode** (per target) from the mean group health score:
//!   below 50 is `emergency`, below 75 `reduced`, otherwise `normal`.
//!   Emergency checks only high priority targets and targets that are
//!   currently failing; reduced skips low priority targets on a healthy
//!   streak of 5 or more.
//! - **Degradation level** (per group) from the fraction of healthy groups
//!   (score >= 50): at least 80% is `NORMAL`, at least 50% `PARTIAL`,
//!   otherwise `CRITICAL`. Partial skips low priority targets in unhealthy
//!   groups; critical skips everything below high priority.
//!
//! A skipped target keeps its health untouched. Groups with no recorded
//! outcomes yet carry no score and are left out of both aggregates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use probegrid_core::{Priority, Target};

use crate::health::{HealthRecord, HealthSummary};

const EMERGENCY_BELOW: f64 = 50.0;
const REDUCED_BELOW: f64 = 75.0;
const HEALTHY_GROUP_SCORE: f64 = 50.0;
const NORMAL_HEALTHY_FRACTION: f64 = 0.8;
const PARTIAL_HEALTHY_FRACTION: f64 = 0.5;
const REDUCED_SKIP_STREAK: u32 = 5;

// ── Modes and levels ──────────────────────────────────────────────

/// Scheduler-wide setting controlling which individual targets run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringMode {
    #[default]
    Normal,
    Reduced,
    Emergency,
}

impl MonitoringMode {
    /// Mode for a set of group scores. No scores means normal.
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::Normal;
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        if mean < EMERGENCY_BELOW {
            Self::Emergency
        } else if mean < REDUCED_BELOW {
            Self::Reduced
        } else {
            Self::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reduced => "reduced",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for MonitoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide severity driving which groups are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DegradationLevel {
    #[default]
    Normal,
    Partial,
    Critical,
}

impl DegradationLevel {
    /// Level for a set of group scores. No scores means normal.
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::Normal;
        }
        let healthy = scores.iter().filter(|s| **s >= HEALTHY_GROUP_SCORE).count();
        let fraction = healthy as f64 / scores.len() as f64;
        if fraction >= NORMAL_HEALTHY_FRACTION {
            Self::Normal
        } else if fraction >= PARTIAL_HEALTHY_FRACTION {
            Self::Partial
        } else {
            Self::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Partial => "PARTIAL",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current mode and level, published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SchedulerState {
    pub mode: MonitoringMode,
    pub level: DegradationLevel,
}

// ── Snapshots ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    /// `None` until a member has been checked.
    pub score: Option<f64>,
    pub targets: usize,
    pub healthy_targets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub mode: MonitoringMode,
    pub level: DegradationLevel,
    pub groups: Vec<GroupSnapshot>,
}

// ── Scheduler ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Outcomes retained per target.
    pub history_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { history_size: 10 }
    }
}

struct TargetEntry {
    target: Target,
    health: HealthRecord,
}

#[derive(Default)]
struct GroupHealth {
    score: Option<f64>,
    targets: usize,
    healthy: usize,
}

struct Inner {
    entries: Vec<TargetEntry>,
    index: HashMap<String, usize>,
    groups: BTreeMap<String, GroupHealth>,
    state: SchedulerState,
}

impl Inner {
    fn scores(&self) -> Vec<f64> {
        self.groups.values().filter_map(|g| g.score).collect()
    }

    fn recompute_group(&mut self, group: &str) {
        let members: Vec<&TargetEntry> = self
            .entries
            .iter()
            .filter(|e| e.target.group == group && e.target.enabled)
            .collect();
        let checked = members.iter().any(|e| !e.health.is_empty());
        let healthy = members.iter().filter(|e| e.health.is_healthy()).count();
        let health = GroupHealth {
            score: (checked && !members.is_empty())
                .then(|| healthy as f64 / members.len() as f64 * 100.0),
            targets: members.len(),
            healthy,
        };
        self.groups.insert(group.to_string(), health);
    }

    fn recompute_state(&mut self) -> Option<SchedulerState> {
        let scores = self.scores();
        let next = SchedulerState {
            mode: MonitoringMode::from_scores(&scores),
            level: DegradationLevel::from_scores(&scores),
        };
        if next == self.state {
            return None;
        }
        let prev = std::mem::replace(&mut self.state, next);
        if next.mode != prev.mode {
            if next.mode == MonitoringMode::Normal {
                info!(from = %prev.mode, to = %next.mode, "monitoring mode changed");
            } else {
                warn!(from = %prev.mode, to = %next.mode, "monitoring mode changed");
            }
        }
        if next.level != prev.level {
            if next.level == DegradationLevel::Normal {
                info!(from = %prev.level, to = %next.level, "degradation level changed");
            } else {
                warn!(from = %prev.level, to = %next.level, "degradation level changed");
            }
        }
        Some(next)
    }

    fn group_is_unhealthy(&self, group: &str) -> bool {
        self.groups
            .get(group)
            .and_then(|g| g.score)
            .is_some_and(|s| s < HEALTHY_GROUP_SCORE)
    }

    fn should_monitor(&self, target: &Target) -> bool {
        let Some(entry) = self.index.get(&target.url).map(|&i| &self.entries[i]) else {
            return true;
        };
        if !entry.target.enabled {
            return false;
        }
        // Never-checked targets always run.
        if entry.health.is_empty() {
            return true;
        }
        match self.state.mode {
            MonitoringMode::Normal => true,
            MonitoringMode::Reduced => !(target.priority == Priority::Low
                && entry.health.healthy_streak() >= REDUCED_SKIP_STREAK),
            MonitoringMode::Emergency => {
                target.priority == Priority::High || entry.health.consecutive_failures() >= 1
            }
        }
    }

    fn should_skip_group(&self, group: &str, priority: Priority) -> bool {
        match self.state.level {
            DegradationLevel::Normal => false,
            DegradationLevel::Partial => priority == Priority::Low && self.group_is_unhealthy(group),
            DegradationLevel::Critical => priority != Priority::High,
        }
    }
}

/// Per-target and per-group health, and the filters derived from it.
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SchedulerState>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, targets: impl IntoIterator<Item = Target>) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::default());
        let scheduler = Self {
            config,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                index: HashMap::new(),
                groups: BTreeMap::new(),
                state: SchedulerState::default(),
            }),
            state_tx,
        };
        for target in targets {
            scheduler.register(target);
        }
        scheduler
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: Option<SchedulerState>) {
        if let Some(state) = state {
            self.state_tx.send_replace(state);
        }
    }

    /// Add a target, or replace the definition of an existing one while
    /// keeping its history.
    pub fn register(&self, target: Target) {
        let changed = {
            let mut inner = self.inner();
            let mut stale_group = None;
            match inner.index.get(&target.url).copied() {
                Some(i) => {
                    let old = std::mem::replace(&mut inner.entries[i].target, target.clone());
                    if old.group != target.group {
                        stale_group = Some(old.group);
                    }
                }
                None => {
                    let i = inner.entries.len();
                    inner.index.insert(target.url.clone(), i);
                    inner.entries.push(TargetEntry {
                        target: target.clone(),
                        health: HealthRecord::new(self.config.history_size),
                    });
                }
            }
            if let Some(group) = stale_group {
                inner.recompute_group(&group);
            }
            inner.recompute_group(&target.group);
            inner.recompute_state()
        };
        debug!(target_url = %target.url, group = %target.group, priority = %target.priority, "target registered");
        self.publish(changed);
    }

    /// Enable or disable a target at runtime. Returns false for an unknown
    /// URL.
    pub fn set_enabled(&self, url: &str, enabled: bool) -> bool {
        let changed = {
            let mut inner = self.inner();
            let Some(&i) = inner.index.get(url) else {
                return false;
            };
            if inner.entries[i].target.enabled == enabled {
                return true;
            }
            inner.entries[i].target.enabled = enabled;
            let group = inner.entries[i].target.group.clone();
            inner.recompute_group(&group);
            inner.recompute_state()
        };
        info!(target_url = url, enabled, "target enablement changed");
        self.publish(changed);
        true
    }

    /// Record the outcome of a completed check and recompute group health,
    /// mode, and level.
    pub fn record_outcome(&self, url: &str, success: bool, latency: Duration) {
        let changed = {
            let mut inner = self.inner();
            let Some(&i) = inner.index.get(url) else {
                debug!(target_url = url, "outcome for unknown target ignored");
                return;
            };
            inner.entries[i].health.record(success, latency);
            let group = inner.entries[i].target.group.clone();
            inner.recompute_group(&group);
            inner.recompute_state()
        };
        self.publish(changed);
    }

    /// Whether the current monitoring mode admits `target`.
    pub fn should_monitor(&self, target: &Target) -> bool {
        self.inner().should_monitor(target)
    }

    /// Whether the current degradation level skips `priority` work in
    /// `group`.
    pub fn should_skip_group(&self, group: &str, priority: Priority) -> bool {
        self.inner().should_skip_group(group, priority)
    }

    /// Enabled targets that pass both filters, in registration order.
    pub fn plan_cycle(&self) -> Vec<Target> {
        let inner = self.inner();
        let mut skipped = 0usize;
        let planned: Vec<Target> = inner
            .entries
            .iter()
            .filter(|e| e.target.enabled)
            .filter(|e| {
                let admit = inner.should_monitor(&e.target)
                    && !inner.should_skip_group(&e.target.group, e.target.priority);
                if !admit {
                    skipped += 1;
                }
                admit
            })
            .map(|e| e.target.clone())
            .collect();
        debug!(
            planned = planned.len(),
            skipped,
            mode = %inner.state.mode,
            level = %inner.state.level,
            "cycle planned"
        );
        planned
    }

    pub fn targets(&self) -> Vec<Target> {
        self.inner().entries.iter().map(|e| e.target.clone()).collect()
    }

    pub fn state(&self) -> SchedulerState {
        self.inner().state
    }

    pub fn mode(&self) -> MonitoringMode {
        self.state().mode
    }

    pub fn level(&self) -> DegradationLevel {
        self.state().level
    }

    /// Watch mode and level changes.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    pub fn group_score(&self, group: &str) -> Option<f64> {
        self.inner().groups.get(group).and_then(|g| g.score)
    }

    pub fn health(&self, url: &str) -> Option<HealthSummary> {
        let inner = self.inner();
        inner
            .index
            .get(url)
            .map(|&i| HealthSummary::from(&inner.entries[i].health))
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.inner();
        SchedulerSnapshot {
            mode: inner.state.mode,
            level: inner.state.level,
            groups: inner
                .groups
                .iter()
                .map(|(name, g)| GroupSnapshot {
                    name: name.clone(),
                    score: g.score,
                    targets: g.targets,
                    healthy_targets: g.healthy,
                })
                .collect(),
        }
    }
}
