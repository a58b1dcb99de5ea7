//! Daemon process lifecycle.
//!
//! At most one daemon runs per [`TorProcess`]. Starting while a live,
//! uncancelled daemon exists hands back the running instance; stopping sends
//! SIGTERM and falls back to SIGKILL after a grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::torrc::TorConfiguration;
use crate::BoxFuture;

/// Time the daemon gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of the daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started.
    NotStarted,
    /// Running with the given process id.
    Running { pid: Option<u32> },
    /// Cancellation requested by [`DaemonLauncher::stop`].
    Cancelled,
    /// Terminated on its own.
    Exited { code: Option<i32> },
}

/// Handle to a started (or reused) daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Process id, if known.
    pub pid: Option<u32>,
    /// True if an already running daemon was handed back.
    pub reused: bool,
}

/// Starts and stops the daemon.
pub trait DaemonLauncher: Send + Sync {
    /// Starts the daemon unless one is already running and not cancelled.
    ///
    /// Does not wait for the daemon to become ready.
    fn start(&self, config: &TorConfiguration) -> Result<ProcessHandle>;

    /// Requests termination. Safe to call when nothing runs.
    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Returns true while the daemon runs and has not been cancelled.
    fn is_running(&self) -> bool;
}

struct Inner {
    state: ProcessState,
    /// Bumped on every spawn so a stale supervisor cannot overwrite state.
    epoch: u64,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

/// Runs the Tor binary as a child process.
pub struct TorProcess {
    inner: Arc<Mutex<Inner>>,
    stop_grace: Duration,
}

impl TorProcess {
    /// Creates a launcher with the default stop grace period.
    pub fn new() -> Self {
        Self::with_stop_grace(DEFAULT_STOP_GRACE)
    }

    /// Creates a launcher with a custom stop grace period.
    pub fn with_stop_grace(stop_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ProcessState::NotStarted,
                epoch: 0,
                cancel: CancellationToken::new(),
                supervisor: None,
            })),
            stop_grace,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        lock(&self.inner).state
    }
}

impl Default for TorProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonLauncher for TorProcess {
    fn start(&self, config: &TorConfiguration) -> Result<ProcessHandle> {
        let mut inner = lock(&self.inner);

        if let ProcessState::Running { pid } = inner.state {
            if !inner.cancel.is_cancelled() {
                debug!(?pid, "Daemon already running, reusing it");
                return Ok(ProcessHandle { pid, reused: true });
            }
        }

        let program = resolve_binary(&config.binary)?;
        let mut child = Command::new(&program)
            .args(config.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ManagerError::ProcessStart(format!("{}: {}", program.display(), e))
            })?;

        let pid = child.id();
        info!(?pid, binary = %program.display(), "Started tor daemon");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let cancel = CancellationToken::new();
        let epoch = inner.epoch + 1;
        let supervisor = tokio::spawn(supervise(
            child,
            cancel.clone(),
            Arc::clone(&self.inner),
            epoch,
            self.stop_grace,
        ));

        inner.epoch = epoch;
        inner.cancel = cancel;
        inner.state = ProcessState::Running { pid };
        inner.supervisor = Some(supervisor);

        Ok(ProcessHandle { pid, reused: false })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let supervisor = {
                let mut inner = lock(&self.inner);
                inner.cancel.cancel();
                if matches!(inner.state, ProcessState::Running { .. }) {
                    inner.state = ProcessState::Cancelled;
                }
                inner.supervisor.take()
            };

            if let Some(supervisor) = supervisor {
                if let Err(e) = supervisor.await {
                    warn!("Daemon supervisor task failed: {}", e);
                }
            }
        })
    }

    fn is_running(&self) -> bool {
        let inner = lock(&self.inner);
        matches!(inner.state, ProcessState::Running { .. }) && !inner.cancel.is_cancelled()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves a bare binary name through `PATH`.
fn resolve_binary(binary: &Path) -> Result<PathBuf> {
    if binary.components().count() > 1 {
        return Ok(binary.to_path_buf());
    }
    which::which(binary)
        .map_err(|e| ManagerError::ProcessStart(format!("{}: {}", binary.display(), e)))
}

/// Waits for the child to exit or for cancellation.
async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    inner: Arc<Mutex<Inner>>,
    epoch: u64,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => {
                    warn!(%status, "Tor daemon exited");
                    status.code()
                }
                Err(e) => {
                    warn!("Failed to wait for tor daemon: {}", e);
                    None
                }
            };
            let mut inner = lock(&inner);
            if inner.epoch == epoch && matches!(inner.state, ProcessState::Running { .. }) {
                inner.state = ProcessState::Exited { code };
            }
        }
        _ = cancel.cancelled() => {
            terminate(&mut child, grace).await;
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        match i32::try_from(pid) {
            Ok(raw) => {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    debug!(pid, "SIGTERM failed: {}", e);
                }
            }
            Err(_) => debug!(pid, "Process id out of range for SIGTERM"),
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "Tor daemon stopped"),
        Ok(Err(e)) => warn!("Failed to wait for tor daemon: {}", e),
        Err(_) => {
            warn!("Tor daemon ignored SIGTERM for {:?}, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tor daemon: {}", e);
            }
        }
    }
}

/// Forwards the daemon's output into the application log.
async fn forward_output<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "tor", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "tor", "Output stream closed: {}", e);
                break;
            }
        }
    }
}
