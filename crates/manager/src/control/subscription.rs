//! Event handler registry with unsubscribe-on-drop handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use protocol::{ControlEvent, EventKind};

use super::EventHandler;

/// Holds at most one handler per event kind.
#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: Mutex<HashMap<EventKind, (u64, EventHandler)>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs `handler` for `kind`, replacing the previous handler.
    pub fn insert(self: &Arc<Self>, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.lock().insert(kind, (id, handler)).is_some() {
            tracing::debug!(?kind, "Replaced existing event handler");
        }
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Delivers `event` to the handler of its kind. Returns false if none is registered.
    pub fn dispatch(&self, event: ControlEvent) -> bool {
        // Handler runs outside the lock so it may subscribe or drop handles.
        let handler = self
            .lock()
            .get(&event.kind())
            .map(|(_, handler)| Arc::clone(handler));
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    /// Returns true if a handler is registered for `kind`.
    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.lock().contains_key(&kind)
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn remove(&self, kind: EventKind, id: u64) {
        let mut handlers = self.lock();
        if handlers.get(&kind).is_some_and(|(current, _)| *current == id) {
            handlers.remove(&kind);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, (u64, EventHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a handler registered until dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    /// The subscribed event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::BootstrapProgress;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = Arc::clone(&count);
        let handler: EventHandler = Arc::new(move |_: ControlEvent| {
            handler_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    fn bootstrap(percent: u8) -> ControlEvent {
        ControlEvent::Bootstrap {
            progress: BootstrapProgress::new(percent).unwrap(),
            tag: None,
            summary: None,
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let registry = SubscriptionRegistry::new();
        let (status_count, handler) = counter();
        let _status = registry.insert(EventKind::Status, handler);

        assert!(registry.dispatch(bootstrap(10)));
        assert!(!registry.dispatch(ControlEvent::CircuitEstablished(true)));
        assert_eq!(status_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        let (count, handler) = counter();
        let subscription = registry.insert(EventKind::CircuitEstablished, handler);
        assert!(registry.is_subscribed(EventKind::CircuitEstablished));

        drop(subscription);
        assert!(!registry.is_subscribed(EventKind::CircuitEstablished));
        assert!(!registry.dispatch(ControlEvent::CircuitEstablished(true)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replacement_survives_old_handle_drop() {
        let registry = SubscriptionRegistry::new();
        let (old_count, old_handler) = counter();
        let (new_count, new_handler) = counter();

        let old = registry.insert(EventKind::Status, old_handler);
        let _new = registry.insert(EventKind::Status, new_handler);
        drop(old);

        assert!(registry.dispatch(bootstrap(50)));
        assert_eq!(old_count.load(Ordering::SeqCst), 0);
        assert_eq!(new_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_outliving_registry() {
        let registry = SubscriptionRegistry::new();
        let (_, handler) = counter();
        let subscription = registry.insert(EventKind::Status, handler);
        drop(registry);
        assert_eq!(subscription.kind(), EventKind::Status);
        drop(subscription);
    }

    #[test]
    fn test_clear() {
        let registry = SubscriptionRegistry::new();
        let (_, a) = counter();
        let (_, b) = counter();
        let _a = registry.insert(EventKind::Status, a);
        let _b = registry.insert(EventKind::CircuitEstablished, b);

        registry.clear();
        assert!(!registry.is_subscribed(EventKind::Status));
        assert!(!registry.is_subscribed(EventKind::CircuitEstablished));
    }
}
