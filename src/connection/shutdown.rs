//! Graceful shutdown

use std::sync::atomic::Ordering;

use tracing::{info, warn};

use super::Connection;
use crate::error::BridgeError;
use crate::state::{ConnectionEvent, ConnectionState};

impl Connection {
    /// Disconnect the transport, drop every subscription and emit `close`
    ///
    /// Idempotent. The connection cannot be connected again afterwards.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.shared.set_state(ConnectionState::Disconnecting);
        info!("Shutting down connection (was {})", previous);

        self.session.store(false, Ordering::Release);
        if self.transport_active.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.transport.disconnect().await {
                warn!("Transport disconnect failed: {}", e);
            }
        }

        let dropped = self.shared.registry.clear();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.events.emit(ConnectionEvent::Close);

        info!("Connection closed ({} subscriptions dropped)", dropped);
        Ok(())
    }
}
