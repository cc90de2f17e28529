//! Connection establishment

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::Connection;
use crate::error::{BridgeError, ConnectionError};
use crate::state::{ConnectionEvent, ConnectionState};
use crate::waiter::{self, WaitOutcome};

impl Connection {
    /// Establish the transport session
    ///
    /// Moves `Disconnected`/`Failed` to `Connecting`, asks the transport to
    /// connect and waits up to the handshake timeout for the session to come
    /// up. Subscriptions registered beforehand are then sent to the transport.
    /// On failure the state is `Failed` and connect may be called again.
    pub async fn connect(&self, address: &str) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        {
            let mut state = self.shared.state.write();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    *state = ConnectionState::Connecting;
                }
                _ => return Err(ConnectionError::AlreadyConnected.into()),
            }
        }

        self.start_pump();
        *self.shared.last_error.lock() = None;
        info!("Connecting to {}", address);

        // Listen before the transport can report anything
        let pending = waiter::arm(
            &self.shared.events,
            &[
                ConnectionEvent::Connect,
                ConnectionEvent::Disconnect,
                ConnectionEvent::Error,
            ],
        );

        self.transport_active.store(true, Ordering::Release);
        if let Err(e) = self.transport.connect(address, self.event_tx.clone()).await {
            drop(pending);
            return Err(self.fail_handshake(e).await);
        }

        match pending.race(self.options.handshake_timeout).await {
            WaitOutcome::Fired(ConnectionEvent::Connect) => {}
            WaitOutcome::Fired(event) => {
                let reason = self
                    .shared
                    .last_error
                    .lock()
                    .take()
                    .unwrap_or_else(|| format!("transport reported {}", event));
                return Err(self.fail_handshake(ConnectionError::Rejected(reason)).await);
            }
            WaitOutcome::TimedOut => {
                return Err(self.fail_handshake(ConnectionError::HandshakeTimeout).await);
            }
            WaitOutcome::Closed => return Err(ConnectionError::Closed.into()),
        }
        // Shutdown began during the handshake and tears the transport down next
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        self.session.store(true, Ordering::Release);
        self.flush_subscriptions().await;

        info!("Connected to {}", address);
        Ok(())
    }

    /// Record a failed handshake and release the transport
    async fn fail_handshake(&self, error: ConnectionError) -> BridgeError {
        warn!("Connect failed: {}", error);
        if !self.is_closed() {
            self.shared.set_state(ConnectionState::Failed);
        }
        if self.transport_active.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.transport.disconnect().await {
                debug!("Transport cleanup after failed connect: {}", e);
            }
        }
        BridgeError::Connection(error)
    }

    /// Send every registered filter to the transport
    async fn flush_subscriptions(&self) {
        let filters = self.shared.registry.filters();
        if filters.is_empty() {
            return;
        }

        debug!("Sending {} pending subscriptions", filters.len());
        for (filter, qos) in filters {
            if let Err(e) = self.transport.subscribe(&filter, qos).await {
                warn!("Subscribe to '{}' failed: {}", filter, e);
            }
        }
    }
}
