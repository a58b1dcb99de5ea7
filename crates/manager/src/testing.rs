//! In-memory fakes of the daemon, control-port and reachability seams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use protocol::{BootstrapProgress, ControlEvent, EventKind, ProtocolError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::{
    AuthCookie, ControlChannel, ControlConnector, EventHandler, Subscription,
    SubscriptionRegistry,
};
use crate::error::{ManagerError, Result};
use crate::process::{DaemonLauncher, ProcessHandle};
use crate::reachability::ReachabilityMonitor;
use crate::torrc::TorConfiguration;
use crate::BoxFuture;

/// A call recorded by [`FakeChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Authenticate(Vec<u8>),
    SetConf(Vec<(String, String)>),
    ResetConf(Vec<String>),
    Subscribe(EventKind),
    IsCircuitEstablished,
    ResetConnection,
    Disconnect,
}

/// Records calls and lets tests inject events.
#[derive(Default)]
pub struct FakeChannel {
    calls: Mutex<Vec<ChannelCall>>,
    registry: Arc<SubscriptionRegistry>,
    reject_auth: AtomicBool,
    fail_set_conf: AtomicBool,
    fail_subscribe: AtomicBool,
    circuit_established: AtomicBool,
    closed: CancellationToken,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &ChannelCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn fail_set_conf(&self, fail: bool) {
        self.fail_set_conf.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Ends the connection from the daemon's side.
    pub fn drop_connection(&self) {
        self.registry.clear();
        self.closed.cancel();
    }

    pub fn set_circuit_established(&self, established: bool) {
        self.circuit_established.store(established, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.registry.is_subscribed(kind)
    }

    /// Delivers an event as the reader task would.
    pub fn emit(&self, event: ControlEvent) -> bool {
        self.registry.dispatch(event)
    }

    pub fn bootstrap(&self, percent: u8) -> bool {
        self.emit(ControlEvent::Bootstrap {
            progress: BootstrapProgress::new(percent).unwrap(),
            tag: None,
            summary: None,
        })
    }

    pub fn circuit(&self, established: bool) -> bool {
        self.emit(ControlEvent::CircuitEstablished(established))
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ControlChannel for FakeChannel {
    fn authenticate(&self, cookie: AuthCookie) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(ChannelCall::Authenticate(cookie.into_bytes()));
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(ManagerError::Authentication(
                    "Authentication failed: Wrong length on authentication cookie.".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn set_conf(&self, pairs: Vec<(String, String)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(ChannelCall::SetConf(pairs));
            if self.fail_set_conf.load(Ordering::SeqCst) {
                return Err(ProtocolError::Rejected {
                    code: 552,
                    message: "Unrecognized option".to_string(),
                }
                .into());
            }
            Ok(())
        })
    }

    fn reset_conf(&self, keys: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(ChannelCall::ResetConf(keys));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> BoxFuture<'_, Result<Subscription>> {
        Box::pin(async move {
            self.record(ChannelCall::Subscribe(kind));
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(ProtocolError::Rejected {
                    code: 552,
                    message: "Unrecognized event".to_string(),
                }
                .into());
            }
            Ok(self.registry.insert(kind, handler))
        })
    }

    fn is_circuit_established(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.record(ChannelCall::IsCircuitEstablished);
            Ok(self.circuit_established.load(Ordering::SeqCst))
        })
    }

    fn reset_connection(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(ChannelCall::ResetConnection);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(ChannelCall::Disconnect);
            self.registry.clear();
            self.closed.cancel();
        })
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Hands out [`FakeChannel`]s, optionally refusing the first connections.
#[derive(Default)]
pub struct FakeConnector {
    refusals: AtomicUsize,
    attempts: AtomicUsize,
    reject_auth: AtomicBool,
    fail_subscribe: AtomicBool,
    circuit_established: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// New channels reject authentication.
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// New channels reject event subscriptions.
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// New channels report an established circuit when asked.
    pub fn circuit_established(&self, established: bool) {
        self.circuit_established.store(established, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn last_channel(&self) -> Arc<FakeChannel> {
        self.channels().pop().expect("no channel opened")
    }
}

impl ControlConnector for FakeConnector {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'_, Result<Arc<dyn ControlChannel>>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(ManagerError::ChannelConnect {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                });
            }

            let channel = FakeChannel::new();
            channel.reject_auth(self.reject_auth.load(Ordering::SeqCst));
            channel.fail_subscribe(self.fail_subscribe.load(Ordering::SeqCst));
            channel.set_circuit_established(self.circuit_established.load(Ordering::SeqCst));
            self.channels.lock().unwrap().push(Arc::clone(&channel));
            Ok(channel as Arc<dyn ControlChannel>)
        })
    }
}

/// Pretends to run a daemon.
#[derive(Default)]
pub struct FakeLauncher {
    running: AtomicBool,
    spawns: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

impl DaemonLauncher for FakeLauncher {
    fn start(&self, _config: &TorConfiguration) -> Result<ProcessHandle> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ManagerError::ProcessStart("tor: not found".to_string()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(ProcessHandle {
                pid: Some(4242),
                reused: true,
            });
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle {
            pid: Some(4242),
            reused: false,
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.running.swap(false, Ordering::SeqCst) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Reachability source driven by the test.
#[derive(Default)]
pub struct FakeMonitor {
    watch_calls: AtomicUsize,
    fail_watch: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<()>>>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Makes `watch` fail as a monitor without routing support would.
    pub fn fail_watch(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// Signals a network change to the current watcher, if any.
    pub async fn notify_change(&self) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(()).await;
        }
    }
}

impl ReachabilityMonitor for FakeMonitor {
    fn watch(&self, _shutdown: CancellationToken) -> Result<mpsc::Receiver<()>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(ManagerError::Reachability(
                "route socket unavailable".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(8);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
