//! Message values passed between the transport and handlers

use bytes::Bytes;

use crate::protocol::QoS;

/// An inbound message as delivered by the transport
///
/// QoS and retain are passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Concrete topic (never contains wildcards)
    pub topic: String,
    /// Opaque payload
    pub payload: Bytes,
    /// Quality of Service the message was delivered with
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Options for an outbound publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn qos(qos: QoS) -> Self {
        Self { qos, retain: false }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}
