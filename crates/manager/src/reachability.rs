//! Host network change detection.
//!
//! A [`ReachabilityMonitor`] produces edge-triggered notifications whenever
//! the host's network path may have changed. Once a connection is up, the
//! [`NetworkChangeReconnector`] forwards those notifications to the
//! orchestrator, which refreshes the daemon with [`apply_network_change`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlChannel;
use crate::error::{ManagerError, Result};

/// Configuration pushed to the daemon after a network change.
pub const NETWORK_CHANGE_CONF: [(&str, &str); 3] = [
    ("ClientPreferIPv6DirPort", "auto"),
    ("ClientPreferIPv6ORPort", "auto"),
    ("ClientUseIPv4", "1"),
];

/// Sources of host network change notifications.
pub trait ReachabilityMonitor: Send + Sync {
    /// Starts watching. A unit value is sent on every change until `shutdown`
    /// is cancelled or the receiver is dropped.
    fn watch(&self, shutdown: CancellationToken) -> Result<mpsc::Receiver<()>>;
}

/// Outbound source addresses the host would use right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteSnapshot {
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
}

impl RouteSnapshot {
    /// Returns true if no outbound route exists.
    pub fn is_offline(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Detects changes by periodically asking the kernel which local address it
/// would route outbound traffic from.
///
/// Probing connects an unbound UDP socket, which performs a route lookup
/// without sending any packet.
#[derive(Debug, Clone)]
pub struct RouteProbeMonitor {
    interval: Duration,
}

impl RouteProbeMonitor {
    /// Probe targets. Any globally routed address works.
    const IPV4_TARGET: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53);
    const IPV6_TARGET: SocketAddr = SocketAddr::new(
        IpAddr::V6(Ipv6Addr::new(0x2620, 0xfe, 0, 0, 0, 0, 0, 0xfe)),
        53,
    );

    /// Creates a monitor probing every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Takes a snapshot of the current outbound routes.
    pub async fn probe() -> RouteSnapshot {
        RouteSnapshot {
            ipv4: probe_route(Self::IPV4_TARGET).await,
            ipv6: probe_route(Self::IPV6_TARGET).await,
        }
    }
}

impl ReachabilityMonitor for RouteProbeMonitor {
    fn watch(&self, shutdown: CancellationToken) -> Result<mpsc::Receiver<()>> {
        if self.interval.is_zero() {
            return Err(ManagerError::Reachability(
                "probe interval must be greater than zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(8);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut last = Self::probe().await;
            debug!(?last, "Initial route snapshot");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let current = Self::probe().await;
                if current == last {
                    continue;
                }
                info!(previous = ?last, ?current, "Host network path changed");
                last = current;

                // A full channel already holds a pending notification.
                if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                    break;
                }
            }
            debug!("Route probe stopped");
        });

        Ok(rx)
    }
}

async fn probe_route(target: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Forwards reachability changes while a connection is established.
pub struct NetworkChangeReconnector {
    monitor: Arc<dyn ReachabilityMonitor>,
    active: Option<(CancellationToken, JoinHandle<()>)>,
}

impl NetworkChangeReconnector {
    /// Creates an inactive reconnector.
    pub fn new(monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        Self {
            monitor,
            active: None,
        }
    }

    /// Starts forwarding changes to `notify`. Does nothing if already active.
    pub fn activate<F>(&mut self, notify: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_active() {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let mut changes = self.monitor.watch(shutdown.clone())?;
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(()) => notify(),
                        None => {
                            warn!("Reachability monitor ended");
                            break;
                        }
                    },
                }
            }
        });

        debug!("Network change reconnector active");
        self.active = Some((shutdown, task));
        Ok(())
    }

    /// Stops forwarding changes.
    pub fn deactivate(&mut self) {
        if let Some((shutdown, task)) = self.active.take() {
            shutdown.cancel();
            task.abort();
            debug!("Network change reconnector inactive");
        }
    }

    /// Returns true while changes are being forwarded.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }
}

impl Drop for NetworkChangeReconnector {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Refreshes a connected daemon after a host network change.
///
/// Configuration failures are logged and do not prevent the circuit reset.
pub async fn apply_network_change(channel: &dyn ControlChannel) -> Result<()> {
    let pairs = NETWORK_CHANGE_CONF
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    if let Err(e) = channel.set_conf(pairs).await {
        warn!("Failed to update network preferences: {}", e);
    }
    channel.reset_connection().await
}
