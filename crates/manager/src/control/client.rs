//! Control-port client over loopback TCP.
//!
//! Commands are written under a lock that also queues a reply slot, so reply
//! slots are always in command order. A reader task decodes incoming lines:
//! asynchronous `650` replies go to the subscription registry, everything
//! else completes the oldest outstanding command.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::{
    Command, ControlEvent, EventKind, ProtocolError, Reply, ReplyDecoder, Signal,
    STATUS_ASYNC_EVENT,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    AuthCookie, ControlChannel, ControlConnector, EventHandler, Subscription,
    SubscriptionRegistry,
};
use crate::error::{ManagerError, Result};
use crate::BoxFuture;

/// Default time to wait for a command reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// `GETINFO` key reporting whether circuits can be built.
const CIRCUIT_ESTABLISHED_KEY: &str = "status/circuit-established";

type ReplySlot = oneshot::Sender<protocol::Result<Reply>>;

#[derive(Default)]
struct PendingReplies {
    queue: VecDeque<ReplySlot>,
    /// Set once the connection is gone; no further slots are accepted.
    closed: Option<String>,
}

impl PendingReplies {
    fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for slot in self.queue.drain(..) {
            let _ = slot.send(Err(ProtocolError::ConnectionClosed(reason.to_string())));
        }
    }
}

/// Opens [`TcpControlClient`] connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    command_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector whose channels use `command_timeout` for replies.
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ControlConnector for TcpConnector {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn ControlChannel>>> {
        Box::pin(async move {
            let client = TcpControlClient::connect(address, self.command_timeout).await?;
            Ok(Arc::new(client) as Arc<dyn ControlChannel>)
        })
    }
}

/// A control-port connection.
pub struct TcpControlClient {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<Mutex<PendingReplies>>,
    registry: Arc<SubscriptionRegistry>,
    /// Event types currently named in `SETEVENTS`.
    event_types: Mutex<BTreeSet<&'static str>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    /// Cancelled when the reader stops, for any reason.
    closed: CancellationToken,
    command_timeout: Duration,
}

impl TcpControlClient {
    /// Connects to the control port at `address`.
    pub async fn connect(address: SocketAddr, command_timeout: Duration) -> Result<Self> {
        let connect_error = |reason: String| ManagerError::ChannelConnect {
            address: address.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(command_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingReplies::default()));
        let registry = SubscriptionRegistry::new();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&registry),
            shutdown.clone(),
            closed.clone(),
        ));

        debug!(%address, "Connected to control port");

        Ok(Self {
            peer: address,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            registry,
            event_types: Mutex::new(BTreeSet::new()),
            reader: Mutex::new(Some(reader)),
            shutdown,
            closed,
            command_timeout,
        })
    }

    /// Sends a command and waits for its reply, whatever the status.
    pub async fn send(&self, command: Command) -> protocol::Result<Reply> {
        let line = command.encode()?;
        let (slot, reply) = oneshot::channel();

        {
            let mut writer = self.writer.lock().await;
            let stream = writer.as_mut().ok_or_else(|| {
                ProtocolError::ConnectionClosed("control channel disconnected".to_string())
            })?;

            {
                let mut pending = lock(&self.pending);
                if let Some(reason) = &pending.closed {
                    return Err(ProtocolError::ConnectionClosed(reason.clone()));
                }
                pending.queue.push_back(slot);
            }

            if let Err(e) = stream.write_all(line.as_bytes()).await {
                let err = ProtocolError::from(e);
                // The queued slot can no longer be matched to a reply.
                lock(&self.pending).close(&err.to_string());
                *writer = None;
                return Err(err);
            }
        }
        trace!(command = %command, "Sent control command");

        match tokio::time::timeout(self.command_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed(
                "reader task ended".to_string(),
            )),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "no reply to {} within {:?}",
                command.keyword(),
                self.command_timeout
            ))),
        }
    }

    /// Sends a command and requires a success reply.
    async fn execute(&self, command: Command) -> Result<Reply> {
        Ok(self.send(command).await?.into_result()?)
    }

    /// Adds the event type carrying `kind` to the daemon's event set.
    ///
    /// `SETEVENTS` replaces the whole set, so every enabled type is resent.
    async fn enable_events(&self, kind: EventKind) -> Result<()> {
        let event_type = kind.event_type();
        let event_types: Vec<String> = {
            let mut enabled = self
                .event_types
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !enabled.insert(event_type) {
                return Ok(());
            }
            enabled.iter().map(|t| t.to_string()).collect()
        };

        if let Err(e) = self.execute(Command::SetEvents(event_types)).await {
            self.event_types
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(event_type);
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                trace!("Control socket shutdown failed: {}", e);
            }
        }
        lock(&self.pending).close("control channel disconnected");
        self.registry.clear();

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Control reader task failed: {}", e);
            }
            debug!(peer = %self.peer, "Disconnected from control port");
        }
        self.closed.cancel();
    }
}

impl ControlChannel for TcpControlClient {
    fn authenticate(&self, cookie: AuthCookie) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let reply = self.send(Command::Authenticate(cookie.into_bytes())).await?;
            match reply.into_result() {
                Ok(_) => {
                    debug!("Authenticated to control port");
                    Ok(())
                }
                Err(ProtocolError::AuthenticationRejected(message)) => {
                    Err(ManagerError::Authentication(message))
                }
                Err(e) => Err(ManagerError::Authentication(e.to_string())),
            }
        })
    }

    fn set_conf(&self, pairs: Vec<(String, String)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.execute(Command::SetConf(pairs)).await?;
            Ok(())
        })
    }

    fn reset_conf(&self, keys: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.execute(Command::ResetConf(keys)).await?;
            Ok(())
        })
    }

    fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> BoxFuture<'_, Result<Subscription>> {
        Box::pin(async move {
            let subscription = self.registry.insert(kind, handler);
            self.enable_events(kind).await?;
            debug!(?kind, "Subscribed to control events");
            Ok(subscription)
        })
    }

    fn is_circuit_established(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let reply = self
                .execute(Command::GetInfo(vec![CIRCUIT_ESTABLISHED_KEY.to_string()]))
                .await?;
            match reply.value(CIRCUIT_ESTABLISHED_KEY) {
                Some(value) => Ok(value == "1"),
                None => Err(ProtocolError::MalformedReply(format!(
                    "GETINFO reply without {}",
                    CIRCUIT_ESTABLISHED_KEY
                ))
                .into()),
            }
        })
    }

    fn reset_connection(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.execute(Command::Signal(Signal::Reload)).await?;
            self.execute(Command::Signal(Signal::Newnym)).await?;
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for TcpControlClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock(pending: &Mutex<PendingReplies>) -> MutexGuard<'_, PendingReplies> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: Arc<Mutex<PendingReplies>>,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut decoder = ReplyDecoder::new();

    let reason = loop {
        buf.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => break "control channel disconnected".to_string(),
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break "control port closed the connection".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read failed: {}", e),
        }
        // Invalid UTF-8 is replaced rather than treated as fatal.
        let line = String::from_utf8_lossy(&buf);

        match decoder.feed(&line) {
            Ok(Some(reply)) if reply.is_async_event() => dispatch_event(&registry, &reply),
            Ok(Some(reply)) => complete(&pending, Ok(reply)),
            Ok(None) => {}
            Err(ProtocolError::ReplyTooLong { code, limit }) if code != STATUS_ASYNC_EVENT => {
                warn!(code, limit, "Control reply too long");
                complete(&pending, Err(ProtocolError::ReplyTooLong { code, limit }));
            }
            Err(e) => warn!("Discarding malformed control reply: {}", e),
        }
    };

    debug!("Control reader stopped: {}", reason);
    lock(&pending).close(&reason);
    closed.cancel();
}

/// Hands a reply to the oldest outstanding command.
fn complete(pending: &Mutex<PendingReplies>, result: protocol::Result<Reply>) {
    match lock(pending).queue.pop_front() {
        Some(slot) => {
            let _ = slot.send(result);
        }
        None => warn!("Unsolicited control reply"),
    }
}

fn dispatch_event(registry: &SubscriptionRegistry, reply: &Reply) {
    match ControlEvent::from_reply(reply) {
        Ok(Some(event)) => {
            trace!(?event, "Control event");
            registry.dispatch(event);
        }
        Ok(None) => trace!(event = reply.message(), "Ignoring unrelated event"),
        Err(e) => debug!("Ignoring malformed event: {}", e),
    }
}
