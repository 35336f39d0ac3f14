//! Prometheus text exposition format.
//!
//! Renders registry snapshots for scraping by a Prometheus server or a
//! node-exporter textfile collector. Counters become `<name>_total`,
//! gauges a plain sample, and histograms a summary with `quantile`
//! labels plus `_sum` and `_count`.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::registry::{MetricKind, MetricSnapshot};

const PREFIX: &str = "probegrid_";

/// Render snapshots into Prometheus text format.
///
/// Series must arrive grouped by name, as [`crate::MetricsRegistry::snapshot`]
/// returns them.
pub fn render_prometheus(snapshots: &[MetricSnapshot]) -> String {
    let mut out = String::new();
    let mut current: Option<&str> = None;

    for s in snapshots {
        let name = metric_name(&s.name, s.kind);
        if current != Some(s.name.as_str()) {
            current = Some(s.name.as_str());
            let kind = match s.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
                MetricKind::Histogram => "summary",
            };
            let _ = writeln!(out, "# TYPE {name} {kind}");
        }

        match s.kind {
            MetricKind::Counter => {
                let _ = writeln!(out, "{name}{} {}", labels(&s.tags, None), s.sum);
            }
            MetricKind::Gauge => {
                let _ = writeln!(out, "{name}{} {}", labels(&s.tags, None), s.last);
            }
            MetricKind::Histogram => {
                for (q, v) in [("0.5", s.p50), ("0.99", s.p99)] {
                    let _ = writeln!(out, "{name}{} {v}", labels(&s.tags, Some(q)));
                }
                let _ = writeln!(out, "{name}_sum{} {}", labels(&s.tags, None), s.sum);
                let _ = writeln!(out, "{name}_count{} {}", labels(&s.tags, None), s.count);
            }
        }
    }

    out
}

fn metric_name(raw: &str, kind: MetricKind) -> String {
    let mut name = String::with_capacity(PREFIX.len() + raw.len() + 6);
    name.push_str(PREFIX);
    name.extend(
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }),
    );
    if kind == MetricKind::Counter && !name.ends_with("_total") {
        name.push_str("_total");
    }
    name
}

fn labels(tags: &BTreeMap<String, String>, quantile: Option<&str>) -> String {
    if tags.is_empty() && quantile.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape(v)))
        .collect();
    if let Some(q) = quantile {
        parts.push(format!("quantile=\"{q}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
