//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`$FLEETCAST_CONFIG`, or the first of the default paths)
//! - Environment variables (`FLEETCAST__*`, e.g. `FLEETCAST__PORT=9000`)

use anyhow::{Context, Result};
use fleetcast_core::{default_groups, DispatcherConfig, FleetGroup, VehicleSpec};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FLEETCAST_CONFIG";

const CONFIG_PATHS: [&str; 3] = [
    "fleetcast.toml",
    "/etc/fleetcast/fleetcast.toml",
    "~/.config/fleetcast/fleetcast.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Simulation tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Seed for initial vehicle placement. Random when unset.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Path to the routes JSON file.
    #[serde(default = "default_routes_path")]
    pub routes_path: String,

    /// Subscriber fan-out settings.
    #[serde(default)]
    pub dispatcher: DispatcherSection,

    /// Telemetry persistence.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Individually configured vehicles.
    #[serde(default)]
    pub fleet: Vec<VehicleSpec>,

    /// Vehicle groups, expanded at startup.
    #[serde(default)]
    pub fleet_groups: Vec<FleetGroup>,
}

/// Subscriber fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Per-subscriber queue capacity, in events.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Failed publish rounds in a row before eviction.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// Send the last-known positions to new subscribers.
    #[serde(default = "default_true")]
    pub snapshot_on_join: bool,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Write every position event to a JSON-lines file.
    #[serde(default)]
    pub enabled: bool,

    /// Output file, appended to.
    #[serde(default = "default_telemetry_path")]
    pub path: String,

    /// Events buffered before new ones are dropped.
    #[serde(default = "default_telemetry_capacity")]
    pub queue_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_routes_path() -> String {
    "data/routes.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_failures() -> u32 {
    3
}

fn default_telemetry_path() -> String {
    "telemetry.jsonl".to_string()
}

fn default_telemetry_capacity() -> usize {
    4096
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tick_interval_ms: default_tick_interval(),
            seed: None,
            routes_path: default_routes_path(),
            dispatcher: DispatcherSection::default(),
            telemetry: TelemetryConfig::default(),
            metrics: MetricsConfig::default(),
            fleet: Vec::new(),
            fleet_groups: Vec::new(),
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_consecutive_failures: default_max_failures(),
            snapshot_on_join: true,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_telemetry_path(),
            queue_capacity: default_telemetry_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = Self::find_file();

        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLEETCAST")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .context("Failed to load configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Simulation tick interval. Never zero.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Dispatcher settings for the core engine.
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.dispatcher.queue_capacity,
            max_consecutive_failures: self.dispatcher.max_consecutive_failures.max(1),
            snapshot_on_join: self.dispatcher.snapshot_on_join,
        }
    }

    /// Every vehicle to spawn: explicit vehicles first, then expanded groups.
    ///
    /// Falls back to the default roster when neither is configured.
    #[must_use]
    pub fn vehicle_specs(&self) -> Vec<VehicleSpec> {
        let groups = if self.fleet.is_empty() && self.fleet_groups.is_empty() {
            default_groups()
        } else {
            self.fleet_groups.clone()
        };

        self.fleet
            .iter()
            .cloned()
            .chain(groups.iter().flat_map(FleetGroup::expand))
            .collect()
    }
}
