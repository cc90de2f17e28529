//! Event pump: the single consumer of a connection's transport events

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::Shared;
use crate::transport::TransportEvent;

pub(super) async fn run(shared: Arc<Shared>, mut event_rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            TransportEvent::Message(message) => {
                let report = shared.registry.dispatch(&message);
                trace!(
                    "Dispatched '{}' to {} handlers ({} failed)",
                    message.topic,
                    report.matched,
                    report.failed
                );
            }
            other => record(&shared, other),
        }
    }
    debug!("Event pump stopped");
}

fn record(shared: &Shared, event: TransportEvent) {
    let Some(lifecycle) = event.lifecycle() else {
        return;
    };

    match &event {
        TransportEvent::Error(reason) => {
            error!("Transport error: {}", reason);
            *shared.last_error.lock() = Some(reason.clone());
        }
        TransportEvent::Disconnect(Some(reason)) => {
            warn!("Transport disconnected: {}", reason);
            *shared.last_error.lock() = Some(reason.clone());
        }
        _ => {}
    }

    if !shared.closed.load(Ordering::Acquire) {
        let mut state = shared.state.write();
        if let Some(next) = state.on_event(lifecycle) {
            info!("Connection state {} -> {} ({})", *state, next, lifecycle);
            *state = next;
        }
    }

    // Listeners run after the state is recorded and without the lock
    shared.events.emit(lifecycle);
}
