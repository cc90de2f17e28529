//! Broker Connection Manager
//!
//! A [`Connection`] exclusively owns one transport and funnels everything the
//! transport reports through a single event pump task: lifecycle events
//! update the state and reach listeners, inbound messages are dispatched to
//! subscriptions, both in delivery order.

mod connect;
mod publish;
mod pump;
mod shutdown;
mod subscribe;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::dispatch::{HandlerFailure, SubscriptionRegistry, DEFAULT_DIAGNOSTICS_CAPACITY};
use crate::error::BridgeError;
use crate::events::EventSurface;
use crate::state::{ConnectionEvent, ConnectionState};
use crate::transport::{EventSender, Transport, TransportEvent};
use crate::waiter;

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long `connect` waits for the transport to report the session
    pub handshake_timeout: Duration,
    /// Buffered handler failures per diagnostics receiver
    pub diagnostics_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl ConnectionOptions {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }
}

/// State shared between a connection and its event pump
struct Shared {
    state: RwLock<ConnectionState>,
    /// Set once by shutdown; transport events no longer change the state
    closed: AtomicBool,
    /// Reason attached to the most recent error or disconnect
    last_error: Mutex<Option<String>>,
    events: Arc<EventSurface>,
    registry: SubscriptionRegistry,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), next)
    }
}

/// One bridge connection to a broker
pub struct Connection {
    transport: Box<dyn Transport>,
    shared: Arc<Shared>,
    options: ConnectionOptions,
    event_tx: EventSender,
    /// Taken by the first connect, which starts the pump
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect and shutdown
    lifecycle: tokio::sync::Mutex<()>,
    /// A transport session was established and not yet shut down
    session: AtomicBool,
    /// The transport was asked to connect and not yet told to disconnect
    transport_active: AtomicBool,
}

impl Connection {
    /// Create a connection in the `Disconnected` state
    ///
    /// Nothing touches the transport until [`connect`](Self::connect), so
    /// listeners and subscriptions can be registered first.
    pub fn new<T: Transport>(transport: T, options: ConnectionOptions) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            events: Arc::new(EventSurface::new()),
            registry: SubscriptionRegistry::with_diagnostics_capacity(
                options.diagnostics_capacity,
            ),
        });

        Self {
            transport: Box::new(transport),
            shared,
            options,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            pump: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            session: AtomicBool::new(false),
            transport_active: AtomicBool::new(false),
        }
    }

    /// Create a connection and connect it to `address`
    pub async fn open<T: Transport>(
        transport: T,
        address: &str,
        options: ConnectionOptions,
    ) -> Result<Self, BridgeError> {
        let connection = Self::new(transport, options);
        connection.connect(address).await?;
        Ok(connection)
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Listener registry for this connection's lifecycle events
    pub fn events(&self) -> &Arc<EventSurface> {
        &self.shared.events
    }

    /// Handler failures observed from now on
    pub fn diagnostics(&self) -> broadcast::Receiver<HandlerFailure> {
        self.shared.registry.diagnostics()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait until one of `events` fires, see [`waiter::wait_for`]
    pub async fn wait_for(
        &self,
        events: &[ConnectionEvent],
        timeout: Duration,
    ) -> Result<ConnectionEvent, BridgeError> {
        waiter::wait_for(self, events, timeout).await
    }

    fn start_pump(&self) {
        if let Some(event_rx) = self.event_rx.lock().take() {
            let handle = tokio::spawn(pump::run(self.shared.clone(), event_rx));
            *self.pump.lock() = Some(handle);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
