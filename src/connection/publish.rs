//! Outbound publishing

use bytes::Bytes;
use tracing::debug;

use super::Connection;
use crate::error::BridgeError;
use crate::message::PublishOptions;
use crate::topic::validate_topic_name;

impl Connection {
    /// Publish `payload` to `topic` through the active session
    ///
    /// Refused with [`BridgeError::NotConnected`] unless the state is
    /// `Connected`, and with [`BridgeError::InvalidTopic`] for names that
    /// cannot be published to; the transport is not called in either case.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<(), BridgeError> {
        let state = self.current_state();
        if !state.is_connected() {
            return Err(BridgeError::NotConnected(state));
        }

        validate_topic_name(topic).map_err(|reason| BridgeError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        })?;

        let payload = payload.into();
        debug!(
            "Publishing {} bytes to '{}' (qos {:?}, retain {})",
            payload.len(),
            topic,
            options.qos,
            options.retain
        );
        self.transport
            .publish(topic, payload, options.qos, options.retain)
            .await?;
        Ok(())
    }
}
