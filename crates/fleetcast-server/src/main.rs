//! # Fleetcast Server
//!
//! Simulates a bus fleet moving along recorded routes and streams live
//! positions to WebSocket subscribers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! fleetcast
//!
//! # Run with a specific config file
//! fleetcast --config /path/to/fleetcast.toml
//!
//! # Override settings through the environment
//! FLEETCAST__PORT=8080 FLEETCAST__TICK_INTERVAL_MS=500 fleetcast
//! ```

mod config;
mod handlers;
mod metrics;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fleetcast")]
#[command(version, about = "Stream simulated bus positions over WebSocket", long_about = None)]
struct Cli {
    /// Config file to load instead of searching the default locations
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetcast=debug,fleetcast_core=debug,fleetcast_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match cli.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting Fleetcast server on {}:{} (tick {} ms)",
        config.host,
        config.port,
        config.tick_interval_ms
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the simulation and server
    handlers::run_server(config).await?;

    Ok(())
}
