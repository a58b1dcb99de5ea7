//! Connection orchestrator.
//!
//! This module provides the `ConnectionOrchestrator`, which brings up the
//! daemon, performs the control-port handshake, follows bootstrap progress
//! and escalates stalled attempts. All state lives in a single actor task;
//! control events, timer expirations, handshake results and network changes
//! reach it as messages tagged with the attempt they belong to, so messages
//! from a superseded attempt are dropped.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::{ControlEvent, EventKind, ProtocolError};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TimeoutConfig};
use crate::control::{
    AuthCookie, ControlChannel, ControlConnector, EventHandler, Subscription, TcpConnector,
};
use crate::delegate::OnionDelegate;
use crate::error::{ManagerError, Result};
use crate::process::{DaemonLauncher, TorProcess};
use crate::reachability::{
    apply_network_change, NetworkChangeReconnector, ReachabilityMonitor, RouteProbeMonitor,
};
use crate::scheduler::{ActionKind, EscalationScheduler, TimerFired};
use crate::session::SessionHandle;
use crate::torrc::TorConfiguration;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt in progress; `start` begins one.
    Idle,
    /// Daemon launched, waiting for a circuit.
    Starting,
    /// A circuit is available.
    Connected,
    /// Stopped explicitly.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(ConnectionState),
    /// An attempt failed.
    Error { message: String },
}

/// The pluggable parts of the orchestrator.
#[derive(Clone)]
pub struct Components {
    pub launcher: Arc<dyn DaemonLauncher>,
    pub connector: Arc<dyn ControlConnector>,
    pub monitor: Arc<dyn ReachabilityMonitor>,
}

impl Components {
    /// Real daemon process, TCP control client and route probing.
    pub fn from_config(config: &Config) -> Self {
        Self {
            launcher: Arc::new(TorProcess::new()),
            connector: Arc::new(TcpConnector::new(config.timeouts.command_timeout())),
            monitor: Arc::new(RouteProbeMonitor::new(Duration::from_secs(
                config.network.probe_interval_secs,
            ))),
        }
    }
}

enum Request {
    Start {
        delegate: Arc<dyn OnionDelegate>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Message {
    HandshakeError {
        attempt: u64,
        error: ManagerError,
    },
    Authenticated {
        attempt: u64,
        session: ControlSession,
    },
    ChannelLost {
        attempt: u64,
    },
    Event {
        attempt: u64,
        event: ControlEvent,
    },
    CircuitStatus {
        attempt: u64,
        established: bool,
    },
    NetworkChanged {
        attempt: u64,
    },
}

/// Owns the daemon and drives connection attempts.
///
/// Dropping the orchestrator stops the daemon.
pub struct ConnectionOrchestrator {
    /// Requests to the actor task.
    requests: mpsc::UnboundedSender<Request>,
    /// Current state, written only by the actor.
    state: Arc<RwLock<ConnectionState>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    /// Cancellation token for the actor task.
    shutdown_token: CancellationToken,
}

impl ConnectionOrchestrator {
    /// Creates an orchestrator using the real daemon, control client and
    /// reachability monitor. Must be called within a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let components = Components::from_config(&config);
        Self::with_components(config, components)
    }

    /// Creates an orchestrator with custom components.
    pub fn with_components(config: Config, components: Components) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(64);
        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let shutdown_token = CancellationToken::new();

        let actor = Actor {
            reconnector: NetworkChangeReconnector::new(Arc::clone(&components.monitor)),
            scheduler: EscalationScheduler::new(timer_tx),
            timeouts: config.timeouts.clone(),
            settings: config,
            components,
            tor_config: None,
            state: ConnectionState::Idle,
            shared_state: Arc::clone(&state),
            event_tx: event_tx.clone(),
            mailbox_tx,
            delegate: None,
            attempt: 0,
            daemon_reused: false,
            handshake: None,
            channel: None,
            status_subscription: None,
            circuit_subscription: None,
            early_events: Vec::new(),
        };
        tokio::spawn(actor.run(request_rx, mailbox_rx, timer_rx, shutdown_token.clone()));

        Self {
            requests,
            state,
            event_tx,
            shutdown_token,
        }
    }

    /// Starts a connection attempt. Does nothing while starting or connected.
    ///
    /// Returns once the daemon has been launched; progress and the outcome
    /// are reported to `delegate`.
    pub async fn start(&self, delegate: Arc<dyn OnionDelegate>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Start { delegate, reply })
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Stops the attempt, the network change reconnector and the daemon.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn actor_gone() -> ManagerError {
    ManagerError::ProcessStart("orchestrator task is not running".to_string())
}

struct Actor {
    settings: Config,
    timeouts: TimeoutConfig,
    components: Components,
    /// Built on the first start and reused afterwards.
    tor_config: Option<TorConfiguration>,
    state: ConnectionState,
    shared_state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    mailbox_tx: mpsc::UnboundedSender<Message>,
    scheduler: EscalationScheduler,
    reconnector: NetworkChangeReconnector,
    delegate: Option<Arc<dyn OnionDelegate>>,
    attempt: u64,
    daemon_reused: bool,
    handshake: Option<CancellationToken>,
    channel: Option<Arc<dyn ControlChannel>>,
    status_subscription: Option<Subscription>,
    circuit_subscription: Option<Subscription>,
    /// Events delivered before the authenticated channel reached the actor.
    early_events: Vec<ControlEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut mailbox: mpsc::UnboundedReceiver<Message>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Orchestrator received shutdown signal");
                    break;
                }
                request = requests.recv() => match request {
                    Some(Request::Start { delegate, reply }) => {
                        let result = self.start(delegate).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Stop { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(message) = mailbox.recv() => self.handle_message(message).await,
                Some(fired) = timers.recv() => self.handle_timer(fired).await,
            }
        }

        if self.state != ConnectionState::Stopped {
            self.stop().await;
        }
    }

    async fn start(&mut self, delegate: Arc<dyn OnionDelegate>) -> Result<()> {
        if matches!(
            self.state,
            ConnectionState::Starting | ConnectionState::Connected
        ) {
            debug!(state = %self.state, "Start ignored, attempt already active");
            return Ok(());
        }

        let config = match &self.tor_config {
            Some(config) => config.clone(),
            None => {
                let config = TorConfiguration::build(&self.settings)?;
                self.tor_config = Some(config.clone());
                config
            }
        };

        let process = self.components.launcher.start(&config)?;

        self.teardown_attempt().await;
        self.attempt += 1;
        self.daemon_reused = process.reused;
        self.delegate = Some(delegate);
        self.set_state(ConnectionState::Starting).await;
        self.scheduler
            .arm(ActionKind::StallRecovery, self.timeouts.stall_recovery());
        self.spawn_handshake(&config, self.timeouts.handshake_delay());

        info!(
            attempt = self.attempt,
            reused = process.reused,
            pid = ?process.pid,
            "Connection attempt started"
        );
        Ok(())
    }

    fn spawn_handshake(&mut self, config: &TorConfiguration, delay: Duration) {
        let cancel = CancellationToken::new();
        let handshake = Handshake {
            attempt: self.attempt,
            address: config.control_addr(),
            cookie_path: config.cookie_path(),
            delay,
            retry: self.timeouts.handshake_retry(),
            connector: Arc::clone(&self.components.connector),
            mailbox: self.mailbox_tx.clone(),
        };
        tokio::spawn(handshake.run(cancel.clone()));
        self.handshake = Some(cancel);
    }

    async fn stop(&mut self) {
        self.teardown_attempt().await;
        self.components.launcher.stop().await;
        self.delegate = None;
        self.set_state(ConnectionState::Stopped).await;
        info!("Orchestrator stopped");
    }

    /// Ends the current attempt: timers, handshake, subscriptions and channel.
    async fn teardown_attempt(&mut self) {
        self.scheduler.disarm_all();
        self.reconnector.deactivate();
        if let Some(cancel) = self.handshake.take() {
            cancel.cancel();
        }
        self.status_subscription = None;
        self.circuit_subscription = None;
        self.early_events.clear();
        if let Some(channel) = self.channel.take() {
            channel.disconnect().await;
        }
        // Anything still in flight now belongs to a superseded attempt.
        self.attempt += 1;
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::HandshakeError { attempt, error } => {
                if attempt == self.attempt {
                    if let Some(delegate) = &self.delegate {
                        delegate.on_handshake_error(&error);
                    }
                }
            }
            Message::Authenticated { attempt, session } => {
                self.on_authenticated(attempt, session).await;
            }
            Message::ChannelLost { attempt } => {
                if attempt == self.attempt {
                    self.on_channel_lost();
                }
            }
            Message::Event { attempt, event } => {
                if attempt != self.attempt {
                    return;
                }
                if self.channel.is_none() && self.state == ConnectionState::Starting {
                    self.early_events.push(event);
                } else {
                    self.on_event(event).await;
                }
            }
            Message::CircuitStatus {
                attempt,
                established,
            } => {
                if attempt == self.attempt && established {
                    self.on_circuit_established().await;
                }
            }
            Message::NetworkChanged { attempt } => {
                if attempt == self.attempt {
                    self.on_network_changed();
                }
            }
        }
    }

    async fn on_authenticated(&mut self, attempt: u64, session: ControlSession) {
        let ControlSession {
            channel,
            status,
            circuit,
        } = session;
        if attempt != self.attempt || self.state != ConnectionState::Starting {
            debug!(attempt, "Dropping channel from a superseded attempt");
            drop((status, circuit));
            channel.disconnect().await;
            return;
        }
        self.handshake = None;
        self.status_subscription = Some(status);
        self.circuit_subscription = Some(circuit);
        self.channel = Some(Arc::clone(&channel));

        let closed = channel.closed();
        let mailbox = self.mailbox_tx.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            let _ = mailbox.send(Message::ChannelLost { attempt });
        });

        info!("Control port opened");
        if let Some(delegate) = &self.delegate {
            delegate.on_ports_opened();
        }
        for event in std::mem::take(&mut self.early_events) {
            self.on_event(event).await;
        }

        let bridge_conf = match (&self.tor_config, self.daemon_reused) {
            (Some(config), true) => Some((config.bridge_conf(), config.uses_bridges())),
            _ => None,
        };
        let mailbox = self.mailbox_tx.clone();
        tokio::spawn(async move {
            if let Some((pairs, uses_bridges)) = bridge_conf {
                reapply_bridges(&*channel, pairs, uses_bridges).await;
            }
            match channel.is_circuit_established().await {
                Ok(established) => {
                    let _ = mailbox.send(Message::CircuitStatus {
                        attempt,
                        established,
                    });
                }
                Err(e) => debug!("Circuit status query failed: {}", e),
            }
        });
    }

    /// The daemon closed the control connection under us.
    fn on_channel_lost(&mut self) {
        if self.channel.take().is_none() {
            return;
        }
        self.status_subscription = None;
        self.circuit_subscription = None;

        match (self.state, self.tor_config.clone()) {
            (ConnectionState::Starting, Some(config)) => {
                warn!("Control connection lost while starting, reconnecting");
                let error = ManagerError::Protocol(ProtocolError::ConnectionClosed(
                    "control port closed the connection".to_string(),
                ));
                if let Some(delegate) = &self.delegate {
                    delegate.on_handshake_error(&error);
                }
                self.spawn_handshake(&config, self.timeouts.handshake_retry());
            }
            (state, _) => warn!(%state, "Control connection lost"),
        }
    }

    async fn on_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Bootstrap {
                progress,
                tag,
                summary,
            } => {
                debug!(%progress, ?tag, ?summary, "Bootstrap progress");
                if let Some(delegate) = &self.delegate {
                    delegate.on_progress(progress.percent());
                }
            }
            ControlEvent::CircuitEstablished(true) => self.on_circuit_established().await,
            ControlEvent::CircuitEstablished(false) => {
                info!("Daemon reports no usable circuit");
            }
        }
    }

    async fn on_circuit_established(&mut self) {
        if self.state != ConnectionState::Starting {
            debug!(state = %self.state, "Ignoring duplicate circuit notification");
            return;
        }

        self.scheduler.disarm_all();
        self.set_state(ConnectionState::Connected).await;
        self.circuit_subscription = None;

        if self.settings.network.watch_reachability {
            let attempt = self.attempt;
            let mailbox = self.mailbox_tx.clone();
            if let Err(e) = self.reconnector.activate(move || {
                let _ = mailbox.send(Message::NetworkChanged { attempt });
            }) {
                warn!("Network change monitoring unavailable: {}", e);
            }
        }

        let socks_addr = match &self.tor_config {
            Some(config) => config.socks_addr(),
            None => SocketAddr::from(([127, 0, 0, 1], self.settings.tor.socks_port)),
        };
        let session = SessionHandle::new(socks_addr);
        info!(proxy = %session, "Connected");
        if let Some(delegate) = &self.delegate {
            delegate.on_connected(session);
        }
    }

    fn on_network_changed(&self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(channel) = &self.channel {
            let channel = Arc::clone(channel);
            tokio::spawn(async move {
                match apply_network_change(&*channel).await {
                    Ok(()) => info!("Circuits reset after network change"),
                    Err(e) => warn!("Failed to reset circuits after network change: {}", e),
                }
            });
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.scheduler.accept(fired) || self.state != ConnectionState::Starting {
            return;
        }

        match fired.kind {
            ActionKind::StallRecovery => {
                match &self.channel {
                    Some(channel) => {
                        info!("Connection stalled, toggling DisableNetwork");
                        tokio::spawn(kick(Arc::clone(channel)));
                    }
                    None => warn!("Connection stalled before the control port opened"),
                }
                self.scheduler
                    .arm(ActionKind::HardFailure, self.timeouts.hard_failure());
            }
            ActionKind::HardFailure => self.fail_attempt().await,
        }
    }

    async fn fail_attempt(&mut self) {
        let error = ManagerError::HardFailure {
            elapsed_secs: self.timeouts.stall_recovery_secs + self.timeouts.hard_failure_secs,
        };
        error!("{}", error);

        // The daemon keeps running so the next start can reuse it.
        self.teardown_attempt().await;
        self.set_state(ConnectionState::Idle).await;
        self.emit_event(OrchestratorEvent::Error {
            message: error.to_string(),
        });
        if let Some(delegate) = self.delegate.take() {
            delegate.on_connection_error(&error);
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        *self.shared_state.write().await = state;
        debug!(%state, "Connection state changed");
        self.emit_event(OrchestratorEvent::StateChanged(state));
    }

    /// Emits an event to all subscribers.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// An authenticated channel with its event subscriptions in place.
struct ControlSession {
    channel: Arc<dyn ControlChannel>,
    status: Subscription,
    circuit: Subscription,
}

/// Connects, authenticates and subscribes, retrying while the control port
/// is not ready.
struct Handshake {
    attempt: u64,
    address: SocketAddr,
    cookie_path: PathBuf,
    delay: Duration,
    retry: Duration,
    connector: Arc<dyn ControlConnector>,
    mailbox: mpsc::UnboundedSender<Message>,
}

impl Handshake {
    async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => debug!(attempt = self.attempt, "Handshake cancelled"),
            _ = self.negotiate() => {}
        }
    }

    async fn negotiate(&self) {
        tokio::time::sleep(self.delay).await;

        loop {
            let error = match self.open().await {
                Ok(session) => {
                    let _ = self.mailbox.send(Message::Authenticated {
                        attempt: self.attempt,
                        session,
                    });
                    return;
                }
                Err(error) => error,
            };

            let retry = error.is_retryable();
            debug!(attempt = self.attempt, retry, "Handshake failed: {}", error);
            let _ = self.mailbox.send(Message::HandshakeError {
                attempt: self.attempt,
                error,
            });
            if !retry {
                return;
            }
            tokio::time::sleep(self.retry).await;
        }
    }

    async fn open(&self) -> Result<ControlSession> {
        let channel = self.connector.connect(self.address).await?;
        match self.prepare(&channel).await {
            Ok((status, circuit)) => Ok(ControlSession {
                channel,
                status,
                circuit,
            }),
            Err(e) => {
                channel.disconnect().await;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        channel: &Arc<dyn ControlChannel>,
    ) -> Result<(Subscription, Subscription)> {
        let cookie = AuthCookie::load(&self.cookie_path)?;
        channel.authenticate(cookie).await?;
        let status = channel.subscribe(EventKind::Status, self.forward()).await?;
        let circuit = channel
            .subscribe(EventKind::CircuitEstablished, self.forward())
            .await?;
        Ok((status, circuit))
    }

    /// Handler posting events to the actor, tagged with this attempt.
    fn forward(&self) -> EventHandler {
        let attempt = self.attempt;
        let mailbox = self.mailbox.clone();
        Arc::new(move |event: ControlEvent| {
            let _ = mailbox.send(Message::Event { attempt, event });
        })
    }
}

/// Toggles the daemon's network off and on to force it to re-evaluate its path.
async fn kick(channel: Arc<dyn ControlChannel>) {
    for value in ["1", "0"] {
        let pairs = vec![("DisableNetwork".to_string(), value.to_string())];
        if let Err(e) = channel.set_conf(pairs).await {
            warn!(value, "Failed to set DisableNetwork: {}", e);
        }
    }
}

/// Brings a reused daemon's bridge settings in line with the configuration.
async fn reapply_bridges(
    channel: &dyn ControlChannel,
    pairs: Vec<(String, String)>,
    uses_bridges: bool,
) {
    if !uses_bridges {
        if let Err(e) = channel.reset_conf(vec!["Bridge".to_string()]).await {
            warn!("Failed to clear bridges: {}", e);
        }
    }
    if let Err(e) = channel.set_conf(pairs).await {
        warn!("Failed to re-apply bridge settings: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{ChannelDelegate, ConnectionEvent};
    use crate::testing::{ChannelCall, FakeConnector, FakeLauncher, FakeMonitor};
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct Harness {
        orchestrator: ConnectionOrchestrator,
        launcher: Arc<FakeLauncher>,
        connector: Arc<FakeConnector>,
        monitor: Arc<FakeMonitor>,
        delegate: Arc<ChannelDelegate>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        _dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_cookie(true)
        }

        fn with_cookie(write_cookie: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.daemon.data_dir = dir.path().to_path_buf();
            if write_cookie {
                let tor_dir = config.tor_data_dir();
                std::fs::create_dir_all(&tor_dir).unwrap();
                std::fs::write(tor_dir.join("control_auth_cookie"), [0x42; 32]).unwrap();
            }
            Self::with_config(config, dir)
        }

        fn with_config(config: Config, dir: TempDir) -> Self {
            let launcher = FakeLauncher::new();
            let connector = FakeConnector::new();
            let monitor = FakeMonitor::new();
            let components = Components {
                launcher: launcher.clone(),
                connector: connector.clone(),
                monitor: monitor.clone(),
            };
            let (delegate, events) = ChannelDelegate::new();
            Self {
                orchestrator: ConnectionOrchestrator::with_components(config, components),
                launcher,
                connector,
                monitor,
                delegate,
                events,
                _dir: dir,
            }
        }

        async fn start(&self) {
            self.orchestrator.start(self.delegate.clone()).await.unwrap();
        }

        fn drain(&mut self) -> Vec<ConnectionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Starts and waits until the control port is open.
        async fn open(&mut self) -> Arc<crate::testing::FakeChannel> {
            self.start().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            settle().await;
            assert_eq!(self.drain(), vec![ConnectionEvent::PortsOpened]);
            self.connector.last_channel()
        }
    }

    /// Lets spawned tasks run without advancing the clock.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn at(start: Instant, secs: u64) {
        tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
        settle().await;
    }

    fn kicks(channel: &crate::testing::FakeChannel) -> usize {
        channel
            .calls()
            .iter()
            .filter(|call| {
                matches!(call, ChannelCall::SetConf(pairs) if pairs[0].0 == "DisableNetwork")
            })
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let h = Harness::new();
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_attempt_timeline() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.start().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);

        at(start, 2).await;
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);
        let channel = h.connector.last_channel();
        assert_eq!(
            channel.calls()[0],
            ChannelCall::Authenticate(vec![0x42; 32])
        );

        at(start, 5).await;
        channel.bootstrap(10);
        settle().await;
        assert_eq!(h.drain(), vec![ConnectionEvent::Progress { percent: 10 }]);

        at(start, 10).await;
        channel.bootstrap(45);
        settle().await;
        assert_eq!(h.drain(), vec![ConnectionEvent::Progress { percent: 45 }]);

        at(start, 12).await;
        channel.circuit(true);
        settle().await;
        let session = SessionHandle::new("127.0.0.1:39059".parse().unwrap());
        assert_eq!(h.drain(), vec![ConnectionEvent::Connected { session }]);
        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);

        // Neither escalation step fires afterwards.
        at(start, 200).await;
        assert!(h.drain().is_empty());
        assert_eq!(kicks(&channel), 0);
        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_attempt_escalates() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.start().await;

        at(start, 29).await;
        let channel = h.connector.last_channel();
        assert_eq!(kicks(&channel), 0);

        at(start, 30).await;
        let calls = channel.calls();
        let kick: Vec<_> = calls
            .iter()
            .filter(|call| matches!(call, ChannelCall::SetConf(_)))
            .collect();
        assert_eq!(
            kick,
            vec![
                &ChannelCall::SetConf(vec![("DisableNetwork".to_string(), "1".to_string())]),
                &ChannelCall::SetConf(vec![("DisableNetwork".to_string(), "0".to_string())]),
            ]
        );
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);

        at(start, 89).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);

        at(start, 90).await;
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ConnectionEvent::ConnectionError { .. }));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);
        assert_eq!(channel.calls().last(), Some(&ChannelCall::Disconnect));
        // The daemon is kept for the next attempt.
        assert_eq!(h.launcher.stops(), 0);
        assert!(h.launcher.is_running());

        // No callbacks for the failed attempt after the terminal one.
        assert!(!channel.bootstrap(50));
        settle().await;
        at(start, 300).await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let mut h = Harness::new();
        h.start().await;
        h.start().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        h.start().await;
        settle().await;

        assert_eq!(h.launcher.spawns(), 1);
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_forwarded_verbatim() {
        let mut h = Harness::new();
        let channel = h.open().await;

        for percent in [100, 30, 70, 100, 0, 5] {
            assert!(channel.bootstrap(percent));
        }
        settle().await;

        let expected: Vec<_> = [100, 30, 70, 100, 0, 5]
            .into_iter()
            .map(|percent| ConnectionEvent::Progress { percent })
            .collect();
        assert_eq!(h.drain(), expected);
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_circuit_events_ignored() {
        let mut h = Harness::new();
        let channel = h.open().await;

        channel.circuit(true);
        settle().await;
        assert!(!channel.circuit(true));
        assert!(!channel.is_subscribed(EventKind::CircuitEstablished));
        assert!(channel.is_subscribed(EventKind::Status));

        let connected = h
            .drain()
            .into_iter()
            .filter(ConnectionEvent::is_terminal)
            .count();
        assert_eq!(connected, 1);

        // Bootstrap reports stay informational after connecting.
        channel.bootstrap(100);
        settle().await;
        assert_eq!(h.drain(), vec![ConnectionEvent::Progress { percent: 100 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_connected_daemon() {
        let mut h = Harness::new();
        h.connector.circuit_established(true);
        h.start().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        let events = h.drain();
        assert_eq!(events[0], ConnectionEvent::PortsOpened);
        assert!(matches!(events[1], ConnectionEvent::Connected { .. }));
        assert_eq!(events.len(), 2);
        assert_eq!(
            h.connector
                .last_channel()
                .count(&ChannelCall::IsCircuitEstablished),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_are_retried() {
        let mut h = Harness::new();
        h.connector.refuse(3);
        let start = Instant::now();
        h.start().await;

        at(start, 3).await;
        let events = h.drain();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| matches!(e, ConnectionEvent::HandshakeError { .. })));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);

        at(start, 4).await;
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);
        assert_eq!(h.connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_rejection_not_retried() {
        let mut h = Harness::new();
        h.connector.reject_auth(true);
        let start = Instant::now();
        h.start().await;

        at(start, 10).await;
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ConnectionEvent::HandshakeError { .. }));
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);

        // Escalation still ends the attempt.
        at(start, 90).await;
        assert!(matches!(
            h.drain().as_slice(),
            [ConnectionEvent::ConnectionError { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cookie_reported() {
        let mut h = Harness::with_cookie(false);
        let start = Instant::now();
        h.start().await;

        at(start, 10).await;
        match h.drain().as_slice() {
            [ConnectionEvent::HandshakeError { message }] => {
                assert!(message.contains("cookie"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(
            h.connector.last_channel().calls(),
            vec![ChannelCall::Disconnect]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_is_fresh_attempt() {
        let mut h = Harness::new();
        let first = h.open().await;
        first.circuit(true);
        settle().await;
        h.drain();

        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Stopped);
        assert_eq!(h.launcher.stops(), 1);
        assert_eq!(first.calls().last(), Some(&ChannelCall::Disconnect));

        // The reconnector is gone with the attempt.
        h.monitor.notify_change().await;
        settle().await;
        assert_eq!(first.count(&ChannelCall::ResetConnection), 0);

        let restart = Instant::now();
        h.start().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);
        assert_eq!(h.launcher.spawns(), 2);

        at(restart, 2).await;
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);
        let second = h.connector.last_channel();
        assert_eq!(h.connector.channels().len(), 2);

        // Fresh timers run from the new start.
        at(restart, 29).await;
        assert_eq!(kicks(&second), 0);
        at(restart, 30).await;
        assert_eq!(kicks(&second), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_handshake() {
        let mut h = Harness::new();
        h.start().await;
        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Stopped);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.connector.attempts(), 0);
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_resets_circuits() {
        let mut h = Harness::new();
        let channel = h.open().await;
        channel.circuit(true);
        settle().await;
        h.drain();

        h.monitor.notify_change().await;
        settle().await;

        let calls = channel.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail,
            &[
                ChannelCall::SetConf(vec![
                    ("ClientPreferIPv6DirPort".to_string(), "auto".to_string()),
                    ("ClientPreferIPv6ORPort".to_string(), "auto".to_string()),
                    ("ClientUseIPv4".to_string(), "1".to_string()),
                ]),
                ChannelCall::ResetConnection,
            ]
        );
        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
        assert_eq!(h.launcher.spawns(), 1);
        assert_eq!(h.monitor.watch_calls(), 1);
        assert_eq!(channel.count(&ChannelCall::Authenticate(vec![0x42; 32])), 1);
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_daemon_reapplies_bridges() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.start().await;
        at(start, 90).await;
        h.drain();
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);

        let restart = Instant::now();
        h.start().await;
        at(restart, 2).await;
        assert_eq!(h.launcher.spawns(), 1);

        let channel = h.connector.last_channel();
        let calls = channel.calls();
        assert!(calls.contains(&ChannelCall::ResetConf(vec!["Bridge".to_string()])));
        assert!(calls.contains(&ChannelCall::SetConf(vec![(
            "UseBridges".to_string(),
            "0".to_string()
        )])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_broadcast() {
        let h = Harness::new();
        let mut events = h.orchestrator.subscribe();
        h.start().await;
        h.orchestrator.stop().await;

        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(ConnectionState::Starting)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(ConnectionState::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = blocker;

        let h = Harness::with_config(config, dir);
        let err = h
            .orchestrator
            .start(h.delegate.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::DirectoryCreation { .. }));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);
        assert_eq!(h.launcher.spawns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_start_failure() {
        let h = Harness::new();
        h.launcher.fail_start(true);
        let err = h
            .orchestrator
            .start(h.delegate.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ProcessStart(_)));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);

        // Retry by starting again.
        h.launcher.fail_start(false);
        h.start().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachability_watch_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().to_path_buf();
        config.network.watch_reachability = false;
        let tor_dir = config.tor_data_dir();
        std::fs::create_dir_all(&tor_dir).unwrap();
        std::fs::write(tor_dir.join("control_auth_cookie"), [0x42; 32]).unwrap();

        let mut h = Harness::with_config(config, dir);
        let channel = h.open().await;
        channel.circuit(true);
        settle().await;

        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
        assert_eq!(h.monitor.watch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_reachability_monitor_still_connects() {
        let mut h = Harness::new();
        h.monitor.fail_watch(true);
        let channel = h.open().await;
        channel.circuit(true);
        settle().await;

        assert!(matches!(
            h.drain().as_slice(),
            [ConnectionEvent::Connected { .. }]
        ));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
        assert_eq!(h.monitor.watch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_any_start() {
        let mut h = Harness::new();
        h.orchestrator.stop().await;

        assert_eq!(h.orchestrator.state().await, ConnectionState::Stopped);
        assert_eq!(h.launcher.stops(), 0);
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_hard_failure_stops_daemon() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.start().await;
        at(start, 90).await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Idle);
        assert_eq!(h.launcher.stops(), 0);
        h.drain();

        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state().await, ConnectionState::Stopped);
        assert_eq!(h.launcher.stops(), 1);
        assert!(!h.launcher.is_running());
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_made_during_handshake() {
        let mut h = Harness::new();
        let channel = h.open().await;

        assert_eq!(
            channel.calls(),
            vec![
                ChannelCall::Authenticate(vec![0x42; 32]),
                ChannelCall::Subscribe(EventKind::Status),
                ChannelCall::Subscribe(EventKind::CircuitEstablished),
                ChannelCall::IsCircuitEstablished,
            ]
        );
        assert!(channel.is_subscribed(EventKind::Status));
        assert!(channel.is_subscribed(EventKind::CircuitEstablished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_is_handshake_error() {
        let mut h = Harness::new();
        h.connector.fail_subscribe(true);
        let start = Instant::now();
        h.start().await;

        at(start, 10).await;
        assert!(matches!(
            h.drain().as_slice(),
            [ConnectionEvent::HandshakeError { .. }]
        ));
        let channel = h.connector.last_channel();
        assert_eq!(channel.calls().last(), Some(&ChannelCall::Disconnect));
        assert!(!channel.is_subscribed(EventKind::Status));
        assert_eq!(h.orchestrator.state().await, ConnectionState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_channel_while_starting_reconnects() {
        let mut h = Harness::new();
        let start = Instant::now();
        let first = h.open().await;

        first.drop_connection();
        settle().await;
        assert!(matches!(
            h.drain().as_slice(),
            [ConnectionEvent::HandshakeError { .. }]
        ));

        // Reconnects after the retry delay, on the same attempt.
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.drain(), vec![ConnectionEvent::PortsOpened]);
        assert_eq!(h.connector.channels().len(), 2);
        let second = h.connector.last_channel();

        second.bootstrap(80);
        second.circuit(true);
        settle().await;
        let events = h.drain();
        assert_eq!(events[0], ConnectionEvent::Progress { percent: 80 });
        assert!(matches!(events[1], ConnectionEvent::Connected { .. }));

        // Connecting on the second channel disarmed the escalation timers.
        at(start, 200).await;
        assert_eq!(kicks(&second), 0);
        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_channel_while_connected() {
        let mut h = Harness::new();
        let channel = h.open().await;
        channel.circuit(true);
        settle().await;
        h.drain();

        channel.drop_connection();
        settle().await;

        assert_eq!(h.orchestrator.state().await, ConnectionState::Connected);
        assert!(h.drain().is_empty());
        assert_eq!(h.connector.channels().len(), 1);

        // Nothing left to reset circuits with.
        h.monitor.notify_change().await;
        settle().await;
        assert_eq!(channel.count(&ChannelCall::ResetConnection), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_daemon() {
        let h = Harness::new();
        h.start().await;
        let launcher = h.launcher.clone();
        drop(h);
        settle().await;
        assert_eq!(launcher.stops(), 1);
    }
}
