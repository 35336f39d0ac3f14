//! Metrics registry: named, tag-qualified numeric series.
//!
//! Each series keeps count, sum, min, max and the last value, plus a
//! bounded window of recent samples for percentiles. Series are created on
//! first write.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::debug;

/// How a series is interpreted by readers and exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic total; `sum` is the value.
    Counter,
    /// Point-in-time level; `last` is the value.
    Gauge,
    /// Distribution of observations.
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    tags: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, tags: &[(&str, &str)]) -> Self {
        let mut tags: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tags.sort();
        Self {
            name: name.to_string(),
            tags,
        }
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct Series {
    kind: MetricKind,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    samples: VecDeque<f64>,
}

impl Series {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            samples: VecDeque::new(),
        }
    }

    fn observe(&mut self, value: f64, max_samples: usize) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        if max_samples > 0 {
            if self.samples.len() == max_samples {
                self.samples.pop_front();
            }
            self.samples.push_back(value);
        }
    }
}

/// Read-only view of one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub kind: MetricKind,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub last: f64,
    /// Percentiles over the retained sample window.
    pub p50: f64,
    pub p99: f64,
}

impl MetricSnapshot {
    /// The value an exporter reports for this series.
    pub fn value(&self) -> f64 {
        match self.kind {
            MetricKind::Counter => self.sum,
            MetricKind::Gauge => self.last,
            MetricKind::Histogram => self.mean,
        }
    }
}

/// Rollup of every series of one metric sharing a tag value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub series: usize,
    pub count: u64,
    pub sum: f64,
    /// Weighted by observation count: `sum / count` over all series.
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Thread-safe store of metric series.
pub struct MetricsRegistry {
    max_samples: usize,
    series: RwLock<BTreeMap<SeriesKey, Series>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MetricsRegistry {
    /// Create a registry retaining up to `max_samples` samples per series.
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SeriesKey, Series>> {
        self.series.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SeriesKey, Series>> {
        self.series.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observe(&self, kind: MetricKind, name: &str, tags: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, tags);
        let mut series = self.write();
        let entry = series.entry(key).or_insert_with(|| {
            debug!(metric = name, ?kind, "metric series created");
            Series::new(kind)
        });
        entry.observe(value, self.max_samples);
    }

    /// Add `by` to a counter.
    pub fn increment(&self, name: &str, tags: &[(&str, &str)], by: u64) {
        self.observe(MetricKind::Counter, name, tags, by as f64);
    }

    /// Set a gauge to `value`.
    pub fn gauge(&self, name: &str, tags: &[(&str, &str)], value: f64) {
        self.observe(MetricKind::Gauge, name, tags, value);
    }

    /// Record one observation (latency, duration, size).
    pub fn record(&self, name: &str, tags: &[(&str, &str)], value: f64) {
        self.observe(MetricKind::Histogram, name, tags, value);
    }

    /// Snapshot of one series.
    pub fn get(&self, name: &str, tags: &[(&str, &str)]) -> Option<MetricSnapshot> {
        let key = SeriesKey::new(name, tags);
        self.read().get(&key).map(|s| snapshot_of(&key, s))
    }

    /// Snapshot of every series, ordered by name then tags.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.read().iter().map(|(k, s)| snapshot_of(k, s)).collect()
    }

    /// Roll up every series of `name` by the value of `tag`.
    ///
    /// The mean is weighted by observation count across the underlying
    /// series, so a group with many checks is not diluted by one with few.
    /// Series without the tag are ignored.
    pub fn aggregate_by_tag(&self, name: &str, tag: &str) -> BTreeMap<String, Aggregate> {
        let series = self.read();
        let mut out: BTreeMap<String, Aggregate> = BTreeMap::new();
        for (key, s) in series.iter().filter(|(k, s)| k.name == name && s.count > 0) {
            let Some(value) = key.tag(tag) else {
                continue;
            };
            let agg = out.entry(value.to_string()).or_insert(Aggregate {
                series: 0,
                count: 0,
                sum: 0.0,
                mean: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            });
            agg.series += 1;
            agg.count += s.count;
            agg.sum += s.sum;
            agg.min = agg.min.min(s.min);
            agg.max = agg.max.max(s.max);
        }
        for agg in out.values_mut() {
            agg.mean = agg.sum / agg.count as f64;
        }
        out
    }

    /// Number of distinct series.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot_of(key: &SeriesKey, s: &Series) -> MetricSnapshot {
    let (p50, p99) = compute_percentiles(&s.samples);
    let empty = s.count == 0;
    MetricSnapshot {
        name: key.name.clone(),
        tags: key.tags.iter().cloned().collect(),
        kind: s.kind,
        count: s.count,
        sum: s.sum,
        min: if empty { 0.0 } else { s.min },
        max: if empty { 0.0 } else { s.max },
        mean: if empty { 0.0 } else { s.sum / s.count as f64 },
        last: s.last,
        p50,
        p99,
    }
}

/// P50 and P99 of a sample window; `(0.0, 0.0)` when empty.
fn compute_percentiles(samples: &VecDeque<f64>) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    (
        sorted[p50_idx.min(sorted.len() - 1)],
        sorted[p99_idx.min(sorted.len() - 1)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Recording ────────────────────────────────────────────────────

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::default();
        m.increment("checks", &[("status", "online")], 1);
        m.increment("checks", &[("status", "online")], 2);
        m.increment("checks", &[("status", "offline")], 1);

        let online = m.get("checks", &[("status", "online")]).unwrap();
        assert_eq!(online.kind, MetricKind::Counter);
        assert_eq!(online.value(), 3.0);
        assert_eq!(online.count, 2);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn tag_order_does_not_matter() {
        let m = MetricsRegistry::default();
        m.increment("checks", &[("a", "1"), ("b", "2")], 1);
        m.increment("checks", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("checks", &[("b", "2"), ("a", "1")]).unwrap().sum, 2.0);
    }

    #[test]
    fn gauge_reports_last_value() {
        let m = MetricsRegistry::default();
        m.gauge("pool_size", &[], 3.0);
        m.gauge("pool_size", &[], 5.0);
        let s = m.get("pool_size", &[]).unwrap();
        assert_eq!(s.value(), 5.0);
        assert_eq!(s.min, 3.0);
        assert_eq!(s.max, 5.0);
    }

    #[test]
    fn histogram_stats_and_percentiles() {
        let m = MetricsRegistry::default();
        for v in 1..=100 {
            m.record("latency_ms", &[], v as f64);
        }
        let s = m.get("latency_ms", &[]).unwrap();
        assert_eq!(s.count, 100);
        assert_eq!(s.mean, 50.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 100.0);
        assert_eq!(s.p50, 51.0);
        assert_eq!(s.p99, 100.0);
    }

    #[test]
    fn sample_window_is_bounded() {
        let m = MetricsRegistry::new(10);
        for v in 0..50 {
            m.record("latency_ms", &[], v as f64);
        }
        let s = m.get("latency_ms", &[]).unwrap();
        // Totals cover everything; percentiles only the last 10 samples.
        assert_eq!(s.count, 50);
        assert_eq!(s.min, 0.0);
        assert!(s.p50 >= 40.0);
    }

    #[test]
    fn unknown_series_is_none() {
        let m = MetricsRegistry::default();
        assert!(m.get("nope", &[]).is_none());
        assert!(m.is_empty());
    }

    // ── Aggregation ──────────────────────────────────────────────────

    #[test]
    fn aggregate_uses_weighted_mean() {
        let m = MetricsRegistry::default();
        // site-a: one target with 3 fast checks, one with 1 slow check.
        for _ in 0..3 {
            m.record("latency_ms", &[("group", "site-a"), ("target", "t1")], 10.0);
        }
        m.record("latency_ms", &[("group", "site-a"), ("target", "t2")], 50.0);
        m.record("latency_ms", &[("group", "site-b"), ("target", "t3")], 7.0);

        let by_group = m.aggregate_by_tag("latency_ms", "group");
        let a = &by_group["site-a"];
        assert_eq!(a.series, 2);
        assert_eq!(a.count, 4);
        // (10*3 + 50) / 4, not (10 + 50) / 2.
        assert_eq!(a.mean, 20.0);
        assert_eq!(a.min, 10.0);
        assert_eq!(a.max, 50.0);
        assert_eq!(by_group["site-b"].mean, 7.0);
    }

    #[test]
    fn aggregate_ignores_untagged_series() {
        let m = MetricsRegistry::default();
        m.record("latency_ms", &[], 1.0);
        m.record("latency_ms", &[("group", "g")], 3.0);
        m.record("other", &[("group", "g")], 100.0);
        let by_group = m.aggregate_by_tag("latency_ms", "group");
        assert_eq!(by_group.len(), 1);
        assert_eq!(by_group["g"].mean, 3.0);
    }

    #[test]
    fn snapshot_serializes() {
        let m = MetricsRegistry::default();
        m.increment("checks", &[("status", "online")], 1);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"kind\":\"counter\""));
        assert!(json.contains("\"status\":\"online\""));
    }
}
