//! Configuration management for the onion manager.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/onion-manager/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default loopback address the control port listens on.
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1";

/// Default control port.
pub const DEFAULT_CONTROL_PORT: u16 = 39069;

/// Default SOCKS port.
pub const DEFAULT_SOCKS_PORT: u16 = 39059;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a non-zero port")]
    InvalidPort { name: &'static str },

    #[error("socks_port and control_port must differ, both are {0}")]
    PortConflict(u16),

    #[error("control_address must be an IP address, got {0}")]
    InvalidControlAddress(String),

    #[error("{name} must be greater than 0")]
    InvalidTimeout { name: &'static str },

    #[error("transport at index {0} has an empty name or listener")]
    InvalidTransport(usize),

    #[error("log_target must be stdout, discard or file:<path>; got {0}")]
    InvalidLogTarget(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the onion manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General process configuration.
    pub daemon: DaemonConfig,

    /// Settings handed to the Tor daemon.
    pub tor: TorSettings,

    /// Escalation and handshake timing.
    pub timeouts: TimeoutConfig,

    /// Host network monitoring.
    pub network: NetworkConfig,
}

/// General process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for manager state. Tor's data directory lives in `<data_dir>/tor`.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file receiving the manager's own log output.
    pub log_file: Option<PathBuf>,
}

/// A pluggable transport the daemon may use, reachable on a local listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    /// Transport name, e.g. `obfs4`.
    pub name: String,

    /// Local SOCKS5 listener of the transport client, e.g. `127.0.0.1:47351`.
    pub listener: String,
}

/// Settings handed to the Tor daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TorSettings {
    /// Daemon executable; relative names are resolved through `PATH`.
    pub binary: PathBuf,

    /// Address the control port binds to.
    pub control_address: String,

    /// Control port.
    pub control_port: u16,

    /// SOCKS port offered to the application.
    pub socks_port: u16,

    /// Allow the daemon to use IPv6 for outgoing connections.
    pub client_use_ipv6: bool,

    /// Daemon log target (`stdout`, `discard` or `file:<path>`).
    /// Defaults to `stdout` in debug builds and `discard` otherwise.
    pub log_target: Option<String>,

    /// Pluggable transport client declarations.
    pub transports: Vec<TransportConfig>,

    /// Bridge lines. Bridges are enabled when this is non-empty.
    pub bridges: Vec<String>,
}

/// Escalation and handshake timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Seconds after attempt start before the stall recovery kick.
    pub stall_recovery_secs: u64,

    /// Seconds after the kick before the attempt is declared failed.
    pub hard_failure_secs: u64,

    /// Milliseconds to wait after launching the daemon before connecting.
    pub handshake_delay_ms: u64,

    /// Milliseconds between control port connection retries.
    pub handshake_retry_ms: u64,

    /// Seconds to wait for a reply to a control command.
    pub command_timeout_secs: u64,
}

/// Host network monitoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Reset circuits when the host's network path changes.
    pub watch_reachability: bool,

    /// Seconds between route probes.
    pub probe_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for TorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            control_address: DEFAULT_CONTROL_ADDRESS.to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            socks_port: DEFAULT_SOCKS_PORT,
            client_use_ipv6: true,
            log_target: None,
            transports: vec![
                TransportConfig {
                    name: "obfs4".to_string(),
                    listener: "127.0.0.1:47351".to_string(),
                },
                TransportConfig {
                    name: "meek_lite".to_string(),
                    listener: "127.0.0.1:47352".to_string(),
                },
            ],
            bridges: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stall_recovery_secs: 30,
            hard_failure_secs: 60,
            handshake_delay_ms: 1000,
            handshake_retry_ms: 1000,
            command_timeout_secs: 10,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            watch_reachability: true,
            probe_interval_secs: 5,
        }
    }
}

impl TimeoutConfig {
    /// Delay before the stall recovery kick.
    pub fn stall_recovery(&self) -> Duration {
        Duration::from_secs(self.stall_recovery_secs)
    }

    /// Delay between the kick and the hard failure.
    pub fn hard_failure(&self) -> Duration {
        Duration::from_secs(self.hard_failure_secs)
    }

    /// Delay before the first control port connection.
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    /// Delay between control port connection attempts.
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    /// Reply timeout for control commands.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("onion-manager")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("onion-manager")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ONION_MANAGER_LOG_LEVEL: Override log level
    /// - ONION_MANAGER_TOR_BINARY: Override the daemon executable
    /// - ONION_MANAGER_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ONION_MANAGER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(binary) = std::env::var("ONION_MANAGER_TOR_BINARY") {
            if !binary.is_empty() {
                tracing::info!("Overriding tor binary from environment: {}", binary);
                self.tor.binary = PathBuf::from(binary);
            }
        }

        if let Ok(dir) = std::env::var("ONION_MANAGER_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tor.control_port == 0 {
            return Err(ConfigError::InvalidPort {
                name: "control_port",
            });
        }
        if self.tor.socks_port == 0 {
            return Err(ConfigError::InvalidPort { name: "socks_port" });
        }
        if self.tor.socks_port == self.tor.control_port {
            return Err(ConfigError::PortConflict(self.tor.socks_port));
        }

        if self.tor.control_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidControlAddress(
                self.tor.control_address.clone(),
            ));
        }

        for (index, transport) in self.tor.transports.iter().enumerate() {
            if transport.name.trim().is_empty() || transport.listener.trim().is_empty() {
                return Err(ConfigError::InvalidTransport(index));
            }
        }

        if let Some(target) = &self.tor.log_target {
            let valid = matches!(target.as_str(), "stdout" | "discard")
                || target.strip_prefix("file:").is_some_and(|p| !p.is_empty());
            if !valid {
                return Err(ConfigError::InvalidLogTarget(target.clone()));
            }
        }

        let timeouts = [
            ("stall_recovery_secs", self.timeouts.stall_recovery_secs),
            ("hard_failure_secs", self.timeouts.hard_failure_secs),
            ("handshake_retry_ms", self.timeouts.handshake_retry_ms),
            ("command_timeout_secs", self.timeouts.command_timeout_secs),
            ("probe_interval_secs", self.network.probe_interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout { name });
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Directory holding the daemon's data, cookie and auth directory.
    pub fn tor_data_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("tor")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
