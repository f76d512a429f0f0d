//! Auricast Server - standalone headless audio router.
//!
//! Binds the configured ingest receivers, applies the boot-time desired
//! state and serves the control API until SIGINT/SIGTERM, then tears the
//! engine down in dependency order.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use auricast_core::{AppState, AudioEngine, Reconciler};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

/// Auricast Server - headless network audio router.
#[derive(Parser, Debug)]
#[command(name = "auricast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "AURICAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Control API port (overrides config file).
    #[arg(short = 'p', long, env = "AURICAST_API_PORT")]
    api_port: Option<u16>,

    /// Desired-state YAML applied at boot (overrides config file).
    #[arg(short = 's', long, env = "AURICAST_INITIAL_STATE")]
    initial_state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Auricast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    if let Some(path) = args.initial_state {
        config.initial_state = Some(path);
    }

    log::info!(
        "Configuration: api={}:{}, scream={:?}, per_process={:?}, rtp={:?}",
        config.bind_ip,
        config.api_port,
        config.scream_port,
        config.per_process_port,
        config.rtp_port,
    );

    // Build and start the engine
    let engine = AudioEngine::new(config.to_engine_config());
    engine.start().context("Failed to start audio engine")?;
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&engine)));

    // Apply the boot-time desired state before opening the API
    if let Some(initial) = config.load_initial_state()? {
        let report = reconciler
            .apply_state(initial)
            .await
            .context("Failed to apply initial state")?;
        let failed = report.ops.iter().filter(|op| !op.success).count();
        log::info!(
            "Initial state applied: {} operations, {} failed",
            report.ops.len(),
            failed
        );
    }

    // Serve the control API
    let app_state = AppState::new(Arc::clone(&engine), Arc::clone(&reconciler));
    let bind = SocketAddr::new(config.bind_ip, config.api_port);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = auricast_core::start_server(app_state, bind).await {
            log::error!("Control API error: {e}");
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful teardown: engine first, then the API task
    engine.stop().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
