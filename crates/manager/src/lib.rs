//! # Onion Manager Library
//!
//! This crate supervises a local Tor daemon on behalf of a host application
//! and tells it when an anonymized network path is ready.
//!
//! ## Overview
//!
//! - **Process Lifecycle**: launch the daemon, reuse it across attempts, stop it
//! - **Control Channel**: cookie authentication and event subscriptions on the control port
//! - **Escalation**: nudge a stalled bootstrap, then give up with a hard failure
//! - **Network Changes**: reset circuits when the host's network path changes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Connection Orchestrator                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │   Process    │  │   Control    │  │     Escalation     │  │
//! │  │  Lifecycle   │  │   Channel    │  │     Scheduler      │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │              Network Change Reconnector                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manager::{ChannelDelegate, Config, ConnectionEvent, ConnectionOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let orchestrator = ConnectionOrchestrator::new(config);
//!
//!     let (delegate, mut events) = ChannelDelegate::new();
//!     orchestrator.start(delegate).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ConnectionEvent::Connected { session } = event {
//!             let client = session.http_client()?;
//!             let body = client.get("https://check.torproject.org/").send().await?;
//!             println!("{}", body.status());
//!             break;
//!         }
//!     }
//!
//!     orchestrator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`torrc`]: Daemon command line built from the configuration
//! - [`process`]: Daemon process supervision
//! - [`control`]: Control-port client
//! - [`scheduler`]: Stall recovery and hard failure timers
//! - [`reachability`]: Host network change detection
//! - [`orchestrator`]: Connection state machine

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod control;
pub mod delegate;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod reachability;
pub mod scheduler;
pub mod session;
pub mod torrc;

#[cfg(test)]
mod testing;

/// Boxed future returned by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use control::{AuthCookie, ControlChannel, ControlConnector, TcpConnector, TcpControlClient};
pub use delegate::{ChannelDelegate, ConnectionEvent, OnionDelegate};
pub use error::{ManagerError, Result};
pub use orchestrator::{Components, ConnectionOrchestrator, ConnectionState, OrchestratorEvent};
pub use process::{DaemonLauncher, ProcessHandle, ProcessState, TorProcess};
pub use reachability::{NetworkChangeReconnector, ReachabilityMonitor, RouteProbeMonitor};
pub use scheduler::{ActionKind, EscalationScheduler};
pub use session::SessionHandle;
pub use torrc::{LogTarget, TorConfiguration};
