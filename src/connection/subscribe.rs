//! Subscription management

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use super::Connection;
use crate::dispatch::SubscriptionHandle;
use crate::error::{BridgeError, ConnectionError, HandlerError};
use crate::message::Message;
use crate::protocol::QoS;
use crate::topic::TopicPattern;

impl Connection {
    /// Subscribe `handler` to every topic matching `pattern`, at QoS 0
    ///
    /// Handlers run on the event pump; a slow handler delays delivery of later
    /// messages. Use [`subscribe_channel`](Self::subscribe_channel) for
    /// consumers that may block.
    pub async fn subscribe<F>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, BridgeError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with_qos(pattern, QoS::AtMostOnce, handler)
            .await
    }

    pub async fn subscribe_with_qos<F>(
        &self,
        pattern: &str,
        qos: QoS,
        handler: F,
    ) -> Result<SubscriptionHandle, BridgeError>
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let filter = pattern.as_str().to_string();
        let previous = self.shared.registry.qos_for(&filter);
        let (handle, _) = self.shared.registry.insert(pattern, qos, Arc::new(handler));

        // The broker only needs to hear about a new filter or a raised QoS.
        // A transport without a live session keeps the registration; the next
        // connect sends it.
        let forward = previous.map_or(true, |prev| qos > prev);
        if forward && self.session.load(Ordering::Acquire) {
            if let Err(e) = self.transport.subscribe(&filter, qos).await {
                warn!(
                    "Subscribe to '{}' not sent ({}), deferred to the next connect",
                    filter, e
                );
            }
        }

        debug!("Subscribed {:?} to '{}' (qos {:?})", handle, filter, qos);
        Ok(handle)
    }

    /// Subscribe with a bounded channel as the handler
    ///
    /// When the channel is full the message is dropped for this subscriber
    /// and reported as a handler failure; dispatch to others never waits.
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<Message>), BridgeError> {
        self.subscribe_channel_with_qos(pattern, QoS::AtMostOnce, capacity)
            .await
    }

    pub async fn subscribe_channel_with_qos(
        &self,
        pattern: &str,
        qos: QoS,
        capacity: usize,
    ) -> Result<(SubscriptionHandle, mpsc::Receiver<Message>), BridgeError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handler = move |message: &Message| match tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => Err(HandlerError::new(format!(
                "subscriber channel full, dropped message on '{}'",
                dropped.topic
            ))),
            Err(TrySendError::Closed(_)) => {
                trace!("Channel subscriber gone, message on '{}' ignored", message.topic);
                Ok(())
            }
        };

        let handle = self.subscribe_with_qos(pattern, qos, handler).await?;
        Ok((handle, rx))
    }

    /// Remove a subscription. Returns false if it was already removed.
    ///
    /// The transport is told to unsubscribe once no subscription remains on
    /// the filter.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, BridgeError> {
        let Some(removed) = self.shared.registry.remove(handle) else {
            return Ok(false);
        };

        debug!("Unsubscribed {:?} from '{}'", handle, removed.filter);
        if removed.last_for_filter && self.session.load(Ordering::Acquire) {
            // Without a session there is nothing to unsubscribe from
            if let Err(e) = self.transport.unsubscribe(&removed.filter).await {
                warn!("Unsubscribe from '{}' not sent: {}", removed.filter, e);
            }
        }
        Ok(true)
    }
}
