//! In-process collaborators: an in-memory [`Store`] and a logging
//! [`AlertSink`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use probegrid_core::{AlertSink, BoxFuture, CheckResult, CheckStatus, Store, StoreError, StoredTarget};

const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub status: CheckStatus,
    pub ip: Option<String>,
}

#[derive(Default)]
struct StoreState {
    targets: HashMap<String, StoredTarget>,
    next_id: u64,
    checks: HashMap<u64, VecDeque<CheckResult>>,
    statuses: HashMap<String, StatusRecord>,
    unavailable: bool,
}

/// Keeps targets, recent checks and last status in memory.
pub struct InMemoryStore {
    history: usize,
    state: Mutex<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl InMemoryStore {
    /// Create a store retaining up to `history` checks per target.
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn with_targets<'a>(urls: impl IntoIterator<Item = &'a str>) -> Self {
        let store = Self::default();
        for url in urls {
            store.register(url);
        }
        store
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `url`, returning its stored identity. Idempotent.
    pub fn register(&self, url: &str) -> StoredTarget {
        let mut st = self.state();
        if let Some(t) = st.targets.get(url) {
            return t.clone();
        }
        st.next_id += 1;
        let target = StoredTarget {
            id: st.next_id,
            url: url.to_string(),
        };
        st.targets.insert(url.to_string(), target.clone());
        target
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn checks(&self, target_id: u64) -> Vec<CheckResult> {
        self.state()
            .checks
            .get(&target_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self, url: &str) -> Option<StatusRecord> {
        self.state().statuses.get(url).cloned()
    }

    fn available(st: &StoreState) -> Result<(), StoreError> {
        if st.unavailable {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Store for InMemoryStore {
    fn get_target<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredTarget>, StoreError>> {
        Box::pin(async move {
            let st = self.state();
            Self::available(&st)?;
            Ok(st.targets.get(url).cloned())
        })
    }

    fn record_check<'a>(
        &'a self,
        target_id: u64,
        result: &'a CheckResult,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut st = self.state();
            Self::available(&st)?;
            let checks = st.checks.entry(target_id).or_default();
            if checks.len() == self.history {
                checks.pop_front();
            }
            checks.push_back(result.clone());
            Ok(())
        })
    }

    fn update_status<'a>(
        &'a self,
        url: &'a str,
        status: CheckStatus,
        ip: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut st = self.state();
            Self::available(&st)?;
            if !st.targets.contains_key(url) {
                return Err(StoreError::NotFound(url.to_string()));
            }
            let ip = ip
                .map(str::to_string)
                .or_else(|| st.statuses.get(url).and_then(|s| s.ip.clone()));
            st.statuses.insert(url.to_string(), StatusRecord { status, ip });
            Ok(())
        })
    }
}

/// Logs a line whenever a target changes between online and offline.
#[derive(Default)]
pub struct LogAlertSink {
    last: Mutex<HashMap<String, CheckStatus>>,
}

impl LogAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last status seen for `url`.
    pub fn last_status(&self, url: &str) -> Option<CheckStatus> {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(url)
            .copied()
    }
}

impl AlertSink for LogAlertSink {
    fn on_check_result<'a>(&'a self, result: &'a CheckResult) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let previous = self
                .last
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(result.url.clone(), result.status);
            match (previous, result.status) {
                (Some(CheckStatus::Online) | None, CheckStatus::Offline) => warn!(
                    target_url = %result.url,
                    group = %result.group,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "target offline"
                ),
                (Some(CheckStatus::Offline), CheckStatus::Online) => info!(
                    target_url = %result.url,
                    group = %result.group,
                    "target recovered"
                ),
                _ => {}
            }
        })
    }
}
