//! In-memory scripted transport
//!
//! Records every call and lets the paired [`MemoryHandle`] play the broker:
//! emit lifecycle events, deliver messages, and decide how handshakes end.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{EventSender, Transport, TransportEvent};
use crate::error::ConnectionError;
use crate::message::Message;
use crate::protocol::QoS;

/// A call made on a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(String),
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Disconnect,
}

/// How [`Transport::connect`] behaves
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Emit `Connect` right away
    #[default]
    Accept,
    /// Emit `Error` with this message
    Refuse(String),
    /// Return this error from `connect` itself
    Fail(ConnectionError),
    /// Emit nothing; the handle decides later
    Silent,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Option<EventSender>>,
    session_up: Mutex<bool>,
    calls: Mutex<Vec<TransportCall>>,
    behavior: Mutex<ConnectBehavior>,
    filter_error: Mutex<Option<ConnectionError>>,
}

impl Shared {
    fn record(&self, call: TransportCall) {
        debug!("Memory transport call: {:?}", call);
        self.calls.lock().push(call);
    }
}

/// Transport that talks to nothing but its [`MemoryHandle`]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Broker side of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            MemoryHandle { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str, events: EventSender) -> Result<(), ConnectionError> {
        self.shared.record(TransportCall::Connect(address.to_string()));

        let behavior = self.shared.behavior.lock().clone();
        match behavior {
            ConnectBehavior::Fail(e) => return Err(e),
            ConnectBehavior::Accept => {
                *self.shared.session_up.lock() = true;
                let _ = events.send(TransportEvent::Connect);
            }
            ConnectBehavior::Refuse(reason) => {
                let _ = events.send(TransportEvent::Error(reason));
            }
            ConnectBehavior::Silent => {}
        }

        *self.shared.events.lock() = Some(events);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ConnectionError> {
        if let Some(e) = self.shared.filter_error.lock().clone() {
            return Err(e);
        }
        self.shared
            .record(TransportCall::Subscribe(filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), ConnectionError> {
        if let Some(e) = self.shared.filter_error.lock().clone() {
            return Err(e);
        }
        self.shared
            .record(TransportCall::Unsubscribe(filter.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        self.shared.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.shared.record(TransportCall::Disconnect);
        let events = self.shared.events.lock().take();
        let was_up = std::mem::take(&mut *self.shared.session_up.lock());
        // Like a real broker session, only an established one reports going down
        if let (Some(events), true) = (events, was_up) {
            let _ = events.send(TransportEvent::Disconnect(None));
        }
        Ok(())
    }
}

impl MemoryHandle {
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.shared.behavior.lock() = behavior;
    }

    /// Make every later `subscribe` and `unsubscribe` fail with `error`, or
    /// succeed again on `None`. Failed calls are not recorded.
    pub fn fail_filter_calls(&self, error: Option<ConnectionError>) {
        *self.shared.filter_error.lock() = error;
    }

    /// Push an event to the connected side. Returns false if nothing is
    /// listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &event {
            TransportEvent::Connect => *self.shared.session_up.lock() = true,
            TransportEvent::Disconnect(_) => *self.shared.session_up.lock() = false,
            _ => {}
        }
        match self.shared.events.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an inbound message as the broker would
    pub fn deliver(&self, message: Message) -> bool {
        self.emit(TransportEvent::Message(message))
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.shared.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.shared.calls.lock().len()
    }

    pub fn publish_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Publish { .. }))
    }

    pub fn subscribe_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Subscribe(..)))
    }

    fn count(&self, f: impl Fn(&TransportCall) -> bool) -> usize {
        self.shared.calls.lock().iter().filter(|c| f(c)).count()
    }
}
