//! Control-port client.
//!
//! The orchestrator talks to the daemon through the [`ControlConnector`] and
//! [`ControlChannel`] traits so tests can substitute in-memory fakes for the
//! TCP implementation in [`client`].

pub mod client;
pub mod cookie;
pub mod subscription;

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{ControlEvent, EventKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::BoxFuture;

pub use client::{TcpConnector, TcpControlClient, DEFAULT_COMMAND_TIMEOUT};
pub use cookie::AuthCookie;
pub use subscription::{Subscription, SubscriptionRegistry};

/// Callback invoked for every event of a subscribed kind.
///
/// Runs on the connection's reader task and must not block.
pub type EventHandler = Arc<dyn Fn(ControlEvent) + Send + Sync>;

/// Opens control channels.
pub trait ControlConnector: Send + Sync {
    /// Connects to the control port. Does not retry.
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn ControlChannel>>>;
}

/// An open control-port connection.
pub trait ControlChannel: Send + Sync {
    /// Authenticates with the cookie the daemon wrote to its data directory.
    fn authenticate(&self, cookie: AuthCookie) -> BoxFuture<'_, Result<()>>;

    /// Sets configuration values on the running daemon.
    fn set_conf(&self, pairs: Vec<(String, String)>) -> BoxFuture<'_, Result<()>>;

    /// Resets configuration keys to their defaults.
    fn reset_conf(&self, keys: Vec<String>) -> BoxFuture<'_, Result<()>>;

    /// Registers the handler for `kind`, replacing any previous one.
    ///
    /// The handler is removed when the returned [`Subscription`] is dropped.
    fn subscribe(&self, kind: EventKind, handler: EventHandler)
        -> BoxFuture<'_, Result<Subscription>>;

    /// Asks whether the daemon can already build circuits.
    fn is_circuit_established(&self) -> BoxFuture<'_, Result<bool>>;

    /// Rebuilds circuits without restarting the daemon.
    fn reset_connection(&self) -> BoxFuture<'_, Result<()>>;

    /// Closes the connection. Idempotent; outstanding commands fail.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Token cancelled once the connection is gone, whether closed locally
    /// or by the daemon.
    fn closed(&self) -> CancellationToken;
}
