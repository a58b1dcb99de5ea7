//! Callbacks from the orchestrator to its host application.
//!
//! Every connection attempt ends with exactly one terminal callback:
//! [`OnionDelegate::on_connected`] or [`OnionDelegate::on_connection_error`].
//! Callbacks run on the orchestrator's task and must not block.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ManagerError;
use crate::session::SessionHandle;

/// Receives connection progress and results.
pub trait OnionDelegate: Send + Sync {
    /// Bootstrap progress, once per event, as reported.
    fn on_progress(&self, percent: u8);

    /// The control port accepted the cookie.
    fn on_ports_opened(&self);

    /// A circuit is available. Terminal.
    fn on_connected(&self, session: SessionHandle);

    /// The attempt failed. Terminal.
    fn on_connection_error(&self, error: &ManagerError);

    /// A handshake step failed; the attempt continues.
    fn on_handshake_error(&self, error: &ManagerError) {
        let _ = error;
    }
}

/// A delegate callback as a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Progress { percent: u8 },
    PortsOpened,
    Connected { session: SessionHandle },
    HandshakeError { message: String },
    ConnectionError { message: String },
}

impl ConnectionEvent {
    /// Returns true for events that end an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Connected { .. } | ConnectionEvent::ConnectionError { .. }
        )
    }
}

/// Delivers callbacks as [`ConnectionEvent`]s over a channel.
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelDelegate {
    /// Creates the delegate and the receiving end of its channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Connection event receiver dropped");
        }
    }
}

impl OnionDelegate for ChannelDelegate {
    fn on_progress(&self, percent: u8) {
        self.send(ConnectionEvent::Progress { percent });
    }

    fn on_ports_opened(&self) {
        self.send(ConnectionEvent::PortsOpened);
    }

    fn on_connected(&self, session: SessionHandle) {
        self.send(ConnectionEvent::Connected { session });
    }

    fn on_connection_error(&self, error: &ManagerError) {
        self.send(ConnectionEvent::ConnectionError {
            message: error.to_string(),
        });
    }

    fn on_handshake_error(&self, error: &ManagerError) {
        self.send(ConnectionEvent::HandshakeError {
            message: error.to_string(),
        });
    }
}
