//! WaveCast Server - standalone broadcast server.
//!
//! Hosts the signaling fabric, the room registry, the MP3 relay, and the
//! shoutcast integration endpoints as a single headless daemon.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use wavecast_core::AppState;

use crate::config::ServerConfig;

/// WaveCast Server - live audio broadcast rooms over HTTP/WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wavecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PORT")]
    port: Option<u16>,

    /// Data directory for persistent state (slug history).
    #[arg(short = 'd', long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("WaveCast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    if config.session_secret.is_none() {
        log::warn!("SESSION_SECRET unset - login and broadcasting are disabled");
    }
    match &config.to_core_config().transcoder_bin {
        Some(bin) => log::info!("Relay transcoding via {}", bin),
        None => log::info!("No transcoder configured - relay serves passthrough audio"),
    }

    let state = AppState::build(config.to_core_config());
    state.start_background_tasks();
    log::info!("Background tasks started");

    tokio::select! {
        result = wavecast_core::start_server(state) => {
            result.context("Server terminated unexpectedly")?;
        }
        _ = signal::ctrl_c() => {
            log::info!("Shutdown signal received, exiting");
        }
    }
    Ok(())
}
