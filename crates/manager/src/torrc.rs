//! Daemon startup configuration.
//!
//! [`TorConfiguration`] is built once from the loaded [`Config`] and turned
//! into the daemon's command line. Building is deterministic; its only side
//! effect is creating the data directory and its `auth` subdirectory.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::config::{Config, TransportConfig};
use crate::error::{ManagerError, Result};

/// Name of the cookie file the daemon writes into its data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Name of the client onion-service authorization directory.
pub const AUTH_DIR_NAME: &str = "auth";

/// Where the daemon writes its own log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output, forwarded into the application log.
    Stdout,
    /// Discarded.
    Discard,
    /// A file on disk.
    File(PathBuf),
}

impl LogTarget {
    /// Target used when none is configured: stdout for debug builds.
    pub fn build_default() -> Self {
        if cfg!(debug_assertions) {
            LogTarget::Stdout
        } else {
            LogTarget::Discard
        }
    }

    /// Value of the daemon's `Log` option.
    pub fn log_option(&self) -> String {
        match self {
            LogTarget::Stdout => "notice stdout".to_string(),
            LogTarget::Discard => "notice file /dev/null".to_string(),
            LogTarget::File(path) => format!("notice file {}", path.display()),
        }
    }
}

impl FromStr for LogTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogTarget::Stdout),
            "discard" => Ok(LogTarget::Discard),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(LogTarget::File(PathBuf::from(path))),
                _ => Err(format!("unknown log target: {}", other)),
            },
        }
    }
}

/// Control-port authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// The daemon writes a random cookie to its data directory.
    Cookie,
}

/// A pluggable transport client the daemon hands connections to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPlugin {
    /// Transport name, e.g. `obfs4`.
    pub name: String,
    /// Local SOCKS5 listener of the transport client.
    pub listener: String,
}

impl TransportPlugin {
    /// Value of the daemon's `ClientTransportPlugin` option.
    pub fn plugin_line(&self) -> String {
        format!("{} socks5 {}", self.name, self.listener)
    }
}

impl From<&TransportConfig> for TransportPlugin {
    fn from(transport: &TransportConfig) -> Self {
        Self {
            name: transport.name.clone(),
            listener: transport.listener.clone(),
        }
    }
}

/// Immutable startup configuration of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConfiguration {
    /// Daemon executable, possibly a bare name to look up in `PATH`.
    pub binary: PathBuf,
    /// Daemon data directory.
    pub data_dir: PathBuf,
    /// Address the control port binds to.
    pub control_address: IpAddr,
    /// Control port.
    pub control_port: u16,
    /// SOCKS port.
    pub socks_port: u16,
    /// Pluggable transports.
    pub transports: Vec<TransportPlugin>,
    /// Control-port authentication scheme.
    pub auth_mode: AuthMode,
    /// Daemon log destination.
    pub log_target: LogTarget,
    /// Allow IPv6 for outgoing connections.
    pub client_use_ipv6: bool,
    /// Bridge lines; empty when bridges are disabled.
    pub bridges: Vec<String>,
}

impl TorConfiguration {
    /// Builds the configuration and prepares the data directory layout.
    pub fn build(settings: &Config) -> Result<Self> {
        let config = Self::from_settings(settings);
        create_dir(&config.data_dir)?;
        create_dir(&config.data_dir.join(AUTH_DIR_NAME))?;
        debug!(data_dir = %config.data_dir.display(), "Prepared daemon data directory");
        Ok(config)
    }

    /// Derives the configuration without touching the filesystem.
    pub fn from_settings(settings: &Config) -> Self {
        let control_address = settings
            .tor
            .control_address
            .parse::<IpAddr>()
            .unwrap_or_else(|_| {
                warn!(
                    address = %settings.tor.control_address,
                    "Invalid control address, using loopback"
                );
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            });

        let log_target = match settings.tor.log_target.as_deref() {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}, using build default", e);
                LogTarget::build_default()
            }),
            None => LogTarget::build_default(),
        };

        Self {
            binary: settings.tor.binary.clone(),
            data_dir: settings.tor_data_dir(),
            control_address,
            control_port: settings.tor.control_port,
            socks_port: settings.tor.socks_port,
            transports: settings.tor.transports.iter().map(Into::into).collect(),
            auth_mode: AuthMode::Cookie,
            log_target,
            client_use_ipv6: settings.tor.client_use_ipv6,
            bridges: settings.tor.bridges.clone(),
        }
    }

    /// Address of the control port.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.control_address, self.control_port)
    }

    /// Address applications reach the SOCKS proxy on.
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.socks_port)
    }

    /// Location of the authentication cookie.
    pub fn cookie_path(&self) -> PathBuf {
        self.data_dir.join(COOKIE_FILE_NAME)
    }

    /// Client onion-service authorization directory.
    pub fn auth_dir(&self) -> PathBuf {
        self.data_dir.join(AUTH_DIR_NAME)
    }

    /// Returns true if bridges are configured.
    pub fn uses_bridges(&self) -> bool {
        !self.bridges.is_empty()
    }

    /// Command-line arguments for the daemon.
    pub fn arguments(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--allow-missing-torrc".into(),
            "--ignore-missing-torrc".into(),
        ];

        let mut option = |key: &str, value: String| {
            args.push(format!("--{}", key));
            args.push(value);
        };

        option("ClientOnly", "1".into());
        option("SocksPort", self.socks_port.to_string());
        option("ControlPort", self.control_addr().to_string());
        match self.auth_mode {
            AuthMode::Cookie => option("CookieAuthentication", "1".into()),
        }
        option("DataDirectory", self.data_dir.display().to_string());
        option("Log", self.log_target.log_option());
        option("ClientUseIPv6", bool_flag(self.client_use_ipv6));
        for transport in &self.transports {
            option("ClientTransportPlugin", transport.plugin_line());
        }
        option("ClientOnionAuthDir", self.auth_dir().display().to_string());
        if self.uses_bridges() {
            option("UseBridges", "1".into());
            for bridge in &self.bridges {
                option("Bridge", bridge.clone());
            }
        }

        args
    }

    /// `SETCONF` pairs that re-apply the bridge settings to a running daemon.
    pub fn bridge_conf(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("UseBridges".to_string(), bool_flag(self.uses_bridges()))];
        pairs.extend(
            self.bridges
                .iter()
                .map(|bridge| ("Bridge".to_string(), bridge.clone())),
        );
        pairs
    }
}

impl fmt::Display for TorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (control {}, socks {})",
            self.binary.display(),
            self.control_addr(),
            self.socks_addr()
        )
    }
}

fn bool_flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| ManagerError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    })
}
