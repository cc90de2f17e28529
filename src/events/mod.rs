//! Connection Event Surface
//!
//! Listener registry for a connection's state-transition events. Listeners are
//! registered per event and detached by id; [`ListenerGuard`] ties a
//! registration to a scope so it is detached on every exit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::state::ConnectionEvent;


/// Identifier of one listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked when a registered event fires
pub type Listener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Event listener registry shared between a connection and its observers
pub struct EventSurface {
    listeners: Mutex<AHashMap<ListenerId, (ConnectionEvent, Listener)>>,
    next_id: AtomicU64,
}

impl EventSurface {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for one event
    pub fn on<F>(&self, event: ConnectionEvent, listener: F) -> ListenerId
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, (event, Arc::new(listener)));
        trace!("Listener {:?} attached to '{}'", id, event);
        id
    }

    /// Register a listener that is detached when the returned guard drops
    pub fn on_scoped<F>(self: &Arc<Self>, event: ConnectionEvent, listener: F) -> ListenerGuard
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.on(event, listener);
        ListenerGuard {
            surface: Arc::downgrade(self),
            id,
        }
    }

    /// Detach a listener. Returns false if it was already detached.
    pub fn off(&self, id: ListenerId) -> bool {
        let removed = self.listeners.lock().remove(&id).is_some();
        if removed {
            trace!("Listener {:?} detached", id);
        }
        removed
    }

    /// Invoke every listener registered for `event`
    ///
    /// Listeners run outside the registry lock, so they may attach or detach
    /// listeners themselves. Returns the number of listeners invoked.
    pub fn emit(&self, event: ConnectionEvent) -> usize {
        // Collect listeners first to avoid holding the lock while calling them
        let targets: SmallVec<[Listener; 8]> = self
            .listeners
            .lock()
            .values()
            .filter(|(e, _)| *e == event)
            .map(|(_, l)| l.clone())
            .collect();

        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    /// Total number of attached listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Number of listeners attached to one event
    pub fn listener_count_for(&self, event: ConnectionEvent) -> usize {
        self.listeners
            .lock()
            .values()
            .filter(|(e, _)| *e == event)
            .count()
    }
}

impl Default for EventSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped listener registration, detached on drop
#[must_use = "the listener is detached as soon as the guard is dropped"]
pub struct ListenerGuard {
    surface: Weak<EventSurface>,
    id: ListenerId,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.upgrade() {
            surface.off(self.id);
        }
    }
}
