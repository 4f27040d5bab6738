//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (`DUET_CONFIG`, or the first of the default paths)
//! - Environment variables (`DUET_*`, `__` between nested keys)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Paths searched when `DUET_CONFIG` is not set.
const DEFAULT_PATHS: [&str; 3] = [
    "duet.toml",
    "/etc/duet/duet.toml",
    "~/.config/duet/duet.toml",
];

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `host:port` does not form a socket address.
    #[error("Invalid listen address {0}")]
    InvalidAddress(String),

    /// A limit that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// The WebSocket path does not start with `/`.
    #[error("WebSocket path must start with '/': {0}")]
    InvalidPath(String),

    /// The idle timeout would fire before the advertised heartbeat.
    #[error("Heartbeat timeout ({timeout_ms}ms) must exceed the interval ({interval_ms}ms)")]
    HeartbeatOrder { interval_ms: u64, timeout_ms: u64 },
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Message store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of each session's outbound queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Maximum rooms a single connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a silent connection is closed, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Which [`duet_core::MessageStore`] backs the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; the backlog is lost on restart.
    Memory,
    /// Embedded sled database at `store.path`.
    Sled,
}

/// Message store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database directory for the sled backend.
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Upper bound for a single store operation, in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
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

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_max_rooms() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sled
}

fn default_store_path() -> String {
    "./data/duet.sled".to_string()
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            max_rooms_per_connection: default_max_rooms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            timeout_ms: default_store_timeout(),
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

impl StoreConfig {
    /// Database directory with `~` expanded.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).as_ref())
    }
}

impl Config {
    /// Load configuration from the first config file found, overlaid with
    /// `DUET_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or variable cannot be parsed, or the
    /// result fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let file = match std::env::var("DUET_CONFIG") {
            Ok(explicit) => Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref())),
            Err(_) => DEFAULT_PATHS
                .iter()
                .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                .find(|path| path.exists()),
        };

        Self::layered(file.as_deref(), environment())
    }

    /// Load configuration from a specific TOML file, without the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn layered(file: Option<&Path>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        let config: Config = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if !self.transport.websocket_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(
                self.transport.websocket_path.clone(),
            ));
        }
        for (name, value) in [
            ("limits.max_connections", self.limits.max_connections),
            ("limits.max_message_size", self.limits.max_message_size),
            ("limits.outbound_queue", self.limits.outbound_queue),
            ("limits.max_rooms_per_connection", self.limits.max_rooms_per_connection),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::Zero("store.timeout_ms"));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat.interval_ms"));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::HeartbeatOrder {
                interval_ms: self.heartbeat.interval_ms,
                timeout_ms: self.heartbeat.timeout_ms,
            });
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidAddress(addr))
    }

    /// Idle timeout for connections.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Upper bound for store operations.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix("DUET")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
