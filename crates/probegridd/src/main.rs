//! probegridd: the probegrid fleet monitor daemon.
//!
//! Single binary that wires the monitoring engine to an HTTP probe, an
//! in-memory store and a logging alert sink:
//! - Orchestrator (cycle loop)
//! - Result cache sweeper
//! - Circuit breaker decay
//! - Memory watchdog
//! - Prometheus textfile export
//!
//! # Usage
//!
//! ```text
//! probegridd run --config /etc/probegrid/probegrid.toml --metrics-file /var/lib/node/probegrid.prom
//! probegridd once --config probegrid.toml
//! probegridd validate --config probegrid.toml
//! ```

mod probe;
mod textfile;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use probegrid_core::MonitorConfig;
use probegrid_monitor::{InMemoryStore, LogAlertSink, Monitor, Orchestrator};

use crate::probe::HttpProbe;

const DEFAULT_FILTER: &str = "info,probegrid=debug,probegridd=debug";

#[derive(Parser)]
#[command(name = "probegridd", about = "probegrid fleet monitor daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor the fleet until interrupted.
    Run {
        /// Path to probegrid.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Rewrite this Prometheus textfile after every cycle.
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
    /// Run a single cycle and print the status snapshot as JSON.
    Once {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Check a configuration file and exit.
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            metrics_file,
        } => run(&config, metrics_file).await,
        Command::Once { config } => once(&config).await,
        Command::Validate { config } => validate(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<MonitorConfig> {
    MonitorConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Store and alert sink seeded with the configured targets.
fn collaborators(config: &MonitorConfig) -> (Arc<InMemoryStore>, Arc<LogAlertSink>) {
    let store = InMemoryStore::with_targets(config.targets.iter().map(|t| t.url.as_str()));
    (Arc::new(store), Arc::new(LogAlertSink::new()))
}

async fn run(config_path: &Path, metrics_file: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    info!(
        config = %config_path.display(),
        targets = config.targets.len(),
        interval_minutes = config.interval_minutes,
        concurrency = config.concurrency_limit,
        "probegridd starting"
    );

    let (store, alerts) = collaborators(&config);
    let monitor = Monitor::new(&config, Arc::new(HttpProbe::new()), store, alerts);

    let exporter = metrics_file.map(|path| {
        info!(path = %path.display(), "metrics textfile export enabled");
        tokio::spawn(textfile::export_after_cycles(
            Arc::clone(monitor.orchestrator()),
            path,
            monitor.orchestrator().subscribe(),
            monitor.shutdown_signal(),
        ))
    });

    monitor.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    monitor.stop().await;
    if let Some(exporter) = exporter {
        let _ = exporter.await;
    }

    info!("probegridd stopped");
    Ok(())
}

async fn once(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let (store, alerts) = collaborators(&config);
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        Arc::new(HttpProbe::new()),
        store,
        alerts,
    ));

    orchestrator.run_cycle().await;
    orchestrator.executor().shutdown().await;

    println!("{}", orchestrator.status().to_json()?);
    Ok(())
}

fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    println!(
        "{}: ok ({} targets, {} groups)",
        config_path.display(),
        config.targets.len(),
        config
            .targets
            .iter()
            .map(|t| t.group.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_metrics_file() {
        let cli = Cli::try_parse_from([
            "probegridd",
            "--log-json",
            "run",
            "--config",
            "probegrid.toml",
            "--metrics-file",
            "out.prom",
        ])
        .unwrap();
        assert!(cli.log_json);
        assert!(matches!(
            cli.command,
            Command::Run { metrics_file: Some(ref p), .. } if p == Path::new("out.prom")
        ));
    }

    #[test]
    fn validate_reports_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probegrid.toml");
        std::fs::write(&path, "concurrency_limit = 0\n").unwrap();
        let err = validate(&path).unwrap_err();
        assert!(format!("{err:#}").contains("concurrency_limit"));
    }

    #[test]
    fn validate_accepts_good_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probegrid.toml");
        std::fs::write(
            &path,
            r#"
interval_minutes = 1

[[targets]]
url = "http://10.0.0.1/status"
group = "site-a"
priority = "high"
"#,
        )
        .unwrap();
        validate(&path).unwrap();
    }

    #[test]
    fn collaborators_register_every_target() {
        let config = MonitorConfig::parse(
            r#"
[[targets]]
url = "http://a/status"
group = "g"

[[targets]]
url = "http://b/status"
group = "g"
"#,
        )
        .unwrap();
        let (store, _) = collaborators(&config);
        assert_eq!(store.register("http://a/status").id, 1);
        assert_eq!(store.register("http://b/status").id, 2);
    }
}
