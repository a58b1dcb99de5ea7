//! Error types for the onion manager.

use std::path::PathBuf;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors produced while bringing up and supervising the daemon.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The data directory or one of its subdirectories could not be created.
    /// Fatal for the session.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The daemon process could not be spawned.
    #[error("failed to start daemon: {0}")]
    ProcessStart(String),

    /// The control port could not be reached.
    #[error("failed to connect to control port {address}: {reason}")]
    ChannelConnect { address: String, reason: String },

    /// The daemon refused the authentication cookie.
    #[error("control port authentication failed: {0}")]
    Authentication(String),

    /// The authentication cookie is absent or unreadable.
    #[error("authentication cookie missing at {path}")]
    MissingCookie { path: PathBuf },

    /// The attempt did not reach a usable circuit within the escalation ceiling.
    #[error("connection attempt failed after {elapsed_secs}s without an established circuit")]
    HardFailure { elapsed_secs: u64 },

    /// Control-port protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Host reachability could not be observed.
    #[error("reachability monitoring failed: {0}")]
    Reachability(String),
}

impl ManagerError {
    /// Returns true if another connection attempt may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            ManagerError::ChannelConnect { .. } => true,
            ManagerError::Protocol(e) => e.is_connection_lost(),
            _ => false,
        }
    }
}

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;
