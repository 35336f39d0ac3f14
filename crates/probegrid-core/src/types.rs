//! Domain types shared by every probegrid crate.
//!
//! Targets are loaded once from configuration and are immutable apart from
//! their `enabled` flag. Check results are produced once per completed
//! check and handed to the store and alert sink.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identity of a monitored target.
pub type TargetUrl = String;

/// Name of a logical group of targets (e.g. a deployment site).
pub type GroupName = String;

// ── Priority ──────────────────────────────────────────────────────

/// Scheduling priority of a target.
///
/// Ordering is by urgency: `High < Medium < Low`, so sorting ascending
/// yields the most urgent work first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    #[serde(alias = "normal")]
    Medium,
    Low,
}

impl Priority {
    /// Queue rank, lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Target ────────────────────────────────────────────────────────

/// One monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub url: TargetUrl,
    pub group: GroupName,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    pub fn new(url: impl Into<String>, group: impl Into<String>, priority: Priority) -> Self {
        Self {
            url: url.into(),
            group: group.into(),
            priority,
            enabled: true,
        }
    }
}

// ── Check results ─────────────────────────────────────────────────

/// Data returned by a successful probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub authorized_count: u32,
    pub unauthorized_count: u32,
    pub ip: Option<String>,
}

/// Reported status of a target after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Online,
    Offline,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Online => "online",
            CheckStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one check, successful or not.
///
/// A failed check always carries `status = Offline` and an error message;
/// it never aborts the monitoring cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub url: TargetUrl,
    pub group: GroupName,
    pub status: CheckStatus,
    pub outcome: Option<ProbeOutcome>,
    pub error: Option<String>,
    /// Wall time spent on the check, in milliseconds.
    pub latency_ms: u64,
    /// Probe attempts made (0 when served from cache or rejected fast).
    pub attempts: u32,
    pub from_cache: bool,
    /// Unix timestamp (milliseconds) when the check completed.
    pub checked_at: u64,
}

impl CheckResult {
    pub fn online(target: &Target, outcome: ProbeOutcome, latency_ms: u64, attempts: u32) -> Self {
        Self {
            url: target.url.clone(),
            group: target.group.clone(),
            status: CheckStatus::Online,
            outcome: Some(outcome),
            error: None,
            latency_ms,
            attempts,
            from_cache: false,
            checked_at: epoch_millis(),
        }
    }

    pub fn offline(
        target: &Target,
        error: impl Into<String>,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            url: target.url.clone(),
            group: target.group.clone(),
            status: CheckStatus::Offline,
            outcome: None,
            error: Some(error.into()),
            latency_ms,
            attempts,
            from_cache: false,
            checked_at: epoch_millis(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == CheckStatus::Online
    }

    /// The IP reported by the probe, if any.
    pub fn ip(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.ip.as_deref())
    }
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
