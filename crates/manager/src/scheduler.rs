//! Stall recovery and hard failure timers.
//!
//! The scheduler owns two slots. Arming a slot aborts whatever timer it held
//! and tags the new one with a fresh generation; when a timer fires it posts a
//! [`TimerFired`] message, and the owner calls [`EscalationScheduler::accept`]
//! to find out whether that message is still current.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The two escalation steps of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Nudge the daemon if it has not connected yet.
    StallRecovery,
    /// Give up on the attempt.
    HardFailure,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::StallRecovery => write!(f, "stall recovery"),
            ActionKind::HardFailure => write!(f, "hard failure"),
        }
    }
}

/// Posted when an armed timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: ActionKind,
    pub generation: u64,
}

/// An armed timer.
#[derive(Debug)]
struct PendingAction {
    generation: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

/// Arms, disarms and validates escalation timers.
pub struct EscalationScheduler {
    slots: HashMap<ActionKind, PendingAction>,
    generation: u64,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl EscalationScheduler {
    /// Creates a scheduler posting expirations to `fired_tx`.
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            slots: HashMap::new(),
            generation: 0,
            fired_tx,
        }
    }

    /// Arms `kind` to fire after `delay`, replacing any armed timer of that kind.
    ///
    /// Returns the generation of the new timer.
    pub fn arm(&mut self, kind: ActionKind, delay: Duration) -> u64 {
        self.disarm(kind);
        self.generation += 1;

        let generation = self.generation;
        let deadline = Instant::now() + delay;
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(TimerFired { kind, generation });
        });

        tracing::debug!(%kind, generation, ?delay, "Armed escalation timer");
        self.slots.insert(
            kind,
            PendingAction {
                generation,
                deadline,
                task,
            },
        );
        generation
    }

    /// Cancels the timer of `kind`. Returns true if one was armed.
    pub fn disarm(&mut self, kind: ActionKind) -> bool {
        match self.slots.remove(&kind) {
            Some(action) => {
                action.task.abort();
                tracing::trace!(%kind, generation = action.generation, "Disarmed escalation timer");
                true
            }
            None => false,
        }
    }

    /// Cancels both timers.
    pub fn disarm_all(&mut self) {
        self.disarm(ActionKind::StallRecovery);
        self.disarm(ActionKind::HardFailure);
    }

    /// Returns true if `kind` is armed.
    pub fn is_armed(&self, kind: ActionKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Deadline of the armed timer of `kind`.
    pub fn deadline(&self, kind: ActionKind) -> Option<Instant> {
        self.slots.get(&kind).map(|action| action.deadline)
    }

    /// Consumes an expiration. Returns false for stale or disarmed timers.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.slots.get(&fired.kind) {
            Some(action) if action.generation == fired.generation => {
                self.slots.remove(&fired.kind);
                true
            }
            _ => {
                tracing::trace!(kind = %fired.kind, generation = fired.generation, "Ignoring stale timer");
                false
            }
        }
    }
}

impl Drop for EscalationScheduler {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
