//! Bounded State Waiter
//!
//! Races a set of connection events against a timeout. Each candidate event
//! gets one scoped listener registration; all of them are released whichever
//! branch wins, including when the waiting future is dropped mid-wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{BridgeError, ConnectionError};
use crate::events::{EventSurface, ListenerGuard};
use crate::state::ConnectionEvent;

/// Result of racing events against a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// This event fired first
    Fired(ConnectionEvent),
    /// Nothing fired before the deadline
    TimedOut,
    /// The event surface went away while waiting
    Closed,
}

/// Listeners registered for one wait, not yet awaited
///
/// Registering before triggering the action that emits the event closes the
/// gap in which the event could fire unobserved.
#[must_use = "listeners are detached when the pending wait is dropped"]
pub struct PendingWait {
    events: Vec<ConnectionEvent>,
    fired_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    guards: Vec<ListenerGuard>,
}

/// Attach one listener per distinct event in `events`
pub fn arm(surface: &Arc<EventSurface>, events: &[ConnectionEvent]) -> PendingWait {
    let mut distinct: Vec<ConnectionEvent> = Vec::with_capacity(events.len());
    for event in events {
        if !distinct.contains(event) {
            distinct.push(*event);
        }
    }

    let (fired_tx, fired_rx) = mpsc::unbounded_channel();
    let guards = distinct
        .iter()
        .map(|&event| {
            let tx = fired_tx.clone();
            surface.on_scoped(event, move |fired| {
                let _ = tx.send(fired);
            })
        })
        .collect();

    PendingWait {
        events: distinct,
        fired_rx,
        guards,
    }
}

impl PendingWait {
    /// Events this wait is listening for
    pub fn events(&self) -> &[ConnectionEvent] {
        &self.events
    }

    /// Wait for the first event or the deadline, then detach every listener
    pub async fn race(self, timeout: Duration) -> WaitOutcome {
        let PendingWait {
            events,
            mut fired_rx,
            guards,
        } = self;

        // No listener holds a sender, so an empty set can only run out the clock
        let outcome = if events.is_empty() {
            tokio::time::sleep(timeout).await;
            WaitOutcome::TimedOut
        } else {
            match tokio::time::timeout(timeout, fired_rx.recv()).await {
                Ok(Some(event)) => WaitOutcome::Fired(event),
                Ok(None) => WaitOutcome::Closed,
                Err(_) => WaitOutcome::TimedOut,
            }
        };

        drop(guards);
        debug!("Wait for {:?} finished: {:?}", events, outcome);
        outcome
    }

    /// Like [`race`](Self::race), mapping non-fired outcomes to typed errors
    pub async fn wait(self, timeout: Duration) -> Result<ConnectionEvent, BridgeError> {
        let events = self.events.clone();
        match self.race(timeout).await {
            WaitOutcome::Fired(event) => Ok(event),
            WaitOutcome::TimedOut => Err(BridgeError::Timeout {
                events,
                after: timeout,
            }),
            WaitOutcome::Closed => Err(BridgeError::Connection(ConnectionError::Closed)),
        }
    }
}

/// Wait until one of `events` fires on `connection`, or fail with
/// [`BridgeError::Timeout`] once `timeout` elapses
///
/// Concurrent waits on one connection are independent; each detaches only its
/// own listeners.
pub async fn wait_for(
    connection: &Connection,
    events: &[ConnectionEvent],
    timeout: Duration,
) -> Result<ConnectionEvent, BridgeError> {
    arm(connection.events(), events).wait(timeout).await
}
