//! tidewatchd: the tidewatch daemon.
//!
//! Watches broker queues and keeps the workloads consuming them in the
//! right state: restarts workloads whose queues back up with no
//! consumer, stops workloads whose queues have sat idle too long.
//!
//! # Usage
//!
//! ```text
//! tidewatchd run --config /etc/tidewatch/tidewatch.toml
//! tidewatchd check-config --config /etc/tidewatch/tidewatch.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use tidewatch_clients::{
    CommandLifecycle, LogNotifier, Notifier, RabbitMqBroker, WebhookNotifier,
};
use tidewatch_core::TidewatchConfig;
use tidewatch_ops::{Collaborators, ManagerConfig, OperationManager};

#[derive(Parser)]
#[command(name = "tidewatchd", about = "tidewatch queue-driven workload manager")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loop until interrupted.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tidewatch=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load(path: &Path) -> anyhow::Result<TidewatchConfig> {
    TidewatchConfig::from_file(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let queues: usize = config.workloads.workloads().map(|(_, q)| q.len()).sum();
    info!(
        path = %path.display(),
        workloads = config.workloads.len(),
        queues,
        "configuration is valid"
    );
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    info!(
        path = %path.display(),
        workloads = config.workloads.len(),
        broker = %config.broker.url,
        "tidewatch daemon starting"
    );

    // ── Collaborators ──────────────────────────────────────────

    let broker = Arc::new(RabbitMqBroker::new(config.broker.clone()));
    let lifecycle = Arc::new(CommandLifecycle::new(
        config.lifecycle.clone(),
        config.timeouts.stop_start_delay,
    ));
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => {
            info!(%url, "webhook notifications enabled");
            Arc::new(WebhookNotifier::new(url.clone(), config.broker.request_timeout))
        }
        None => Arc::new(LogNotifier),
    };

    let manager = Arc::new(OperationManager::new(
        Arc::new(config.workloads),
        ManagerConfig {
            polling_interval: config.polling.interval,
            timeouts: config.timeouts,
            recipient: config.notify.recipient,
        },
        Collaborators {
            broker,
            lifecycle,
            notifier,
        },
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::clone(&manager);
    let loop_handle = tokio::spawn(async move {
        runner.run(shutdown_rx).await;
    });

    wait_for_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = loop_handle.await {
        warn!(error = %e, "reconciliation loop ended abnormally");
    }

    info!("tidewatch daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
