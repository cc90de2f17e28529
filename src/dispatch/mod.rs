//! Subscription registry and message dispatch
//!
//! Every subscription pairs one parsed [`TopicPattern`] with one handler.
//! Dispatch walks the registry in registration order and invokes each
//! matching handler exactly once. A handler that fails or panics is reported
//! on the diagnostics channel and never stops delivery to the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::HandlerError;
use crate::message::Message;
use crate::protocol::QoS;
use crate::topic::TopicPattern;

#[cfg(test)]
mod tests;

/// Default capacity of the diagnostics broadcast channel
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// Callback invoked for every matching inbound message
pub type Handler = Arc<dyn Fn(&Message) -> Result<(), HandlerError> + Send + Sync>;

/// Identifies one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A handler failure observed during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionHandle,
    /// Filter of the failing subscription
    pub pattern: String,
    /// Topic of the message being handled
    pub topic: String,
    pub error: HandlerError,
    /// The handler panicked rather than returning an error
    pub panicked: bool,
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Handlers whose pattern matched
    pub matched: usize,
    /// Matched handlers that returned an error or panicked
    pub failed: usize,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.matched - self.failed
    }
}

/// What [`SubscriptionRegistry::remove`] took out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub filter: String,
    /// No subscription on this filter remains
    pub last_for_filter: bool,
}

struct Entry {
    handle: SubscriptionHandle,
    pattern: TopicPattern,
    qos: QoS,
    handler: Handler,
}

/// Registry of subscriptions, shared by the connection and its event pump
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    failures: broadcast::Sender<HandlerFailure>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_diagnostics_capacity(DEFAULT_DIAGNOSTICS_CAPACITY)
    }

    pub fn with_diagnostics_capacity(capacity: usize) -> Self {
        let (failures, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures,
        }
    }

    /// Register a subscription
    ///
    /// Returns its handle and whether it is the first subscription on its
    /// filter string.
    pub fn insert(
        &self,
        pattern: TopicPattern,
        qos: QoS,
        handler: Handler,
    ) -> (SubscriptionHandle, bool) {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        let first = !entries
            .iter()
            .any(|e| e.pattern.as_str() == pattern.as_str());

        trace!("Subscription {:?} added on '{}'", handle, pattern);
        entries.push(Entry {
            handle,
            pattern,
            qos,
            handler,
        });
        (handle, first)
    }

    /// Remove a subscription. `None` if it was already removed.
    pub fn remove(&self, handle: SubscriptionHandle) -> Option<Removed> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|e| e.handle == handle)?;
        let entry = entries.remove(index);

        let filter = entry.pattern.as_str().to_string();
        let last_for_filter = !entries.iter().any(|e| e.pattern.as_str() == filter);
        trace!("Subscription {:?} removed from '{}'", handle, filter);

        Some(Removed {
            filter,
            last_for_filter,
        })
    }

    /// Distinct filters with the highest QoS requested on each, in first
    /// registration order
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let entries = self.entries.read();
        let mut filters: Vec<(String, QoS)> = Vec::new();
        for entry in entries.iter() {
            match filters.iter_mut().find(|(f, _)| f == entry.pattern.as_str()) {
                Some((_, qos)) => *qos = (*qos).max(entry.qos),
                None => filters.push((entry.pattern.as_str().to_string(), entry.qos)),
            }
        }
        filters
    }

    /// Highest QoS currently requested on `filter`
    pub fn qos_for(&self, filter: &str) -> Option<QoS> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.pattern.as_str() == filter)
            .map(|e| e.qos)
            .max()
    }

    /// Drop every subscription
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.entries.read().iter().any(|e| e.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Receiver for handler failures reported from now on
    pub fn diagnostics(&self) -> broadcast::Receiver<HandlerFailure> {
        self.failures.subscribe()
    }

    /// Deliver a message to every subscription whose pattern matches its topic
    ///
    /// Handlers run outside the registry lock, in registration order.
    pub fn dispatch(&self, message: &Message) -> DispatchReport {
        let targets: SmallVec<[(SubscriptionHandle, String, Handler); 4]> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.pattern.matches(&message.topic))
            .map(|e| (e.handle, e.pattern.as_str().to_string(), e.handler.clone()))
            .collect();

        let mut report = DispatchReport {
            matched: targets.len(),
            failed: 0,
        };

        for (handle, pattern, handler) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(message)));
            let (error, panicked) = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => (e, false),
                Err(payload) => (HandlerError::new(panic_message(payload.as_ref())), true),
            };

            report.failed += 1;
            warn!(
                "Handler for '{}' failed on '{}'{}: {}",
                pattern,
                message.topic,
                if panicked { " (panicked)" } else { "" },
                error.message()
            );

            // No receivers is fine; the failure is already logged
            let _ = self.failures.send(HandlerFailure {
                subscription: handle,
                pattern,
                topic: message.topic.clone(),
                error,
                panicked,
            });
        }

        report
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
