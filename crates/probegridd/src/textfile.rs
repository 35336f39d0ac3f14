//! Prometheus textfile export.
//!
//! After every cycle the daemon rewrites the metrics file so a
//! node-exporter textfile collector (or anything else) can scrape it.
//! Writes go to a sibling temp file first and are renamed into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use probegrid_core::Probe;
use probegrid_monitor::{CycleReport, Orchestrator};

pub async fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Rewrite `path` after every cycle until shutdown.
pub async fn export_after_cycles<P: Probe>(
    orchestrator: Arc<Orchestrator<P>>,
    path: PathBuf,
    mut reports: broadcast::Receiver<CycleReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Ok(report) => {
                    let text = orchestrator.status().to_prometheus();
                    match write_atomic(&path, &text).await {
                        Ok(()) => debug!(cycle = report.cycle, path = %path.display(), "metrics written"),
                        Err(e) => warn!(error = %e, "failed to write metrics file"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "cycle reports lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
