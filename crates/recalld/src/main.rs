//! Recall recovery daemon entry point.

use anyhow::Result;
use clap::Parser;
use recall_common::RecoveryConfig;
use recalld::{MemoryServiceClient, PendingQueue, RecoveryDaemon, RecoveryMonitor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long `stop` waits for the recovery loop to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "recalld", version, about = "Background recovery daemon for buffered conversation exchanges")]
struct Args {
    /// Config file path (default: ~/.config/recall/recovery.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the backup root directory
    #[arg(long)]
    backup_root: Option<PathBuf>,

    /// Override the remote memory service URL
    #[arg(long)]
    service_url: Option<String>,

    /// Override the base recovery interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Log filter directive (falls back to RUST_LOG, then "info")
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log_filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => RecoveryConfig::load(path)?,
        None => RecoveryConfig::load_or_default(),
    };
    if let Some(root) = args.backup_root {
        config.backup_root = root;
    }
    if let Some(url) = args.service_url {
        config.service_url = url;
    }
    if let Some(interval) = args.interval {
        config.base_interval_secs = interval;
    }

    info!(
        "recalld v{} starting (root={}, service={})",
        env!("CARGO_PKG_VERSION"),
        config.backup_root.display(),
        config.service_url
    );

    let queue = Arc::new(PendingQueue::new(&config.backup_root)?);
    let client = MemoryServiceClient::new(&config)?;
    let monitor = Arc::new(Mutex::new(RecoveryMonitor::new(config.clone())));
    let daemon = RecoveryDaemon::new(config, Arc::clone(&queue), client, monitor);

    daemon.start().await?;
    info!("Recovery daemon running ({} pending)", queue.count());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    let joined = daemon.stop(STOP_TIMEOUT).await?;
    if !joined {
        info!("Recovery loop still draining; exiting anyway");
    }

    let status = daemon.get_recovery_status().await;
    info!(
        "Final: {} processed, {} succeeded, {} failed, {} still pending",
        status.total_processed, status.total_succeeded, status.total_failed, status.pending_count
    );

    Ok(())
}
