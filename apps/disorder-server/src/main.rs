//! disorderd - Standalone server for DisOrder, the multi-user network
//! jukebox.
//!
//! Loads configuration, bootstraps every core service, binds the
//! listener set, and runs until a shutdown signal arrives.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use disorder_core::{bootstrap_services_at, listener};
use tokio::signal;

use crate::config::load_config;

/// disorderd - the DisOrder network jukebox server.
#[derive(Parser, Debug)]
#[command(name = "disorderd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "DISORDER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive (e.g. `info`, `disorder_core=debug`).
    #[arg(long, default_value = "info", env = "DISORDER_LOG_LEVEL")]
    log_level: String,

    /// Track library root (overrides config file).
    #[arg(long, env = "DISORDER_ROOT")]
    root: Option<PathBuf>,

    /// State directory for the queue journal, user database, and cookie
    /// keys (overrides config file).
    #[arg(long, env = "DISORDER_HOME")]
    home: Option<PathBuf>,

    /// Primary client listen address (overrides config file).
    #[arg(long, env = "DISORDER_LISTEN")]
    listen: Option<SocketAddr>,

    /// RTP broadcast/multicast destination (overrides config file).
    #[arg(long, env = "DISORDER_BROADCAST")]
    broadcast: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting disorderd");

    let config = load_config(&args).context("failed to load configuration")?;

    let services = Arc::new(
        bootstrap_services_at(&config, args.config.clone()).context("failed to bootstrap services")?,
    );
    tracing::info!(
        listen = %config.listen,
        root = %config.root.display(),
        "services bootstrapped"
    );

    let shutdown = services.shutdown.clone();
    let listener_handle = tokio::spawn(listener::run(services.clone(), shutdown.clone()));

    // SIGTERM/SIGINT/SIGHUP are handled by the bootstrapped `SignalHub`
    // (SIGHUP reconfigures in place; SIGTERM/SIGINT cancel `shutdown`).
    // Ctrl+C is also honored directly here so `shutdown` wakes up even
    // if the hub's own signal stream is ever unavailable.
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("ctrl-c received, winding down");
            services.shutdown();
        }
    }

    let _ = listener_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
