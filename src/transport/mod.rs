//! Broker Transport
//!
//! The capability a [`Connection`](crate::Connection) drives: establish a
//! session, subscribe, publish, disconnect. Implementations report session
//! lifecycle and inbound messages as [`TransportEvent`]s on the channel handed
//! to [`Transport::connect`].

mod memory;
mod mqtt;

pub use memory::{ConnectBehavior, MemoryHandle, MemoryTransport, TransportCall};
pub use mqtt::MqttTransport;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::message::Message;
use crate::protocol::QoS;
use crate::state::ConnectionEvent;

/// Default MQTT port over plain TCP
pub const DEFAULT_PORT: u16 = 1883;

/// Sender half of a connection's event channel
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established (handshake accepted)
    Connect,
    /// Session lost or closed
    Disconnect(Option<String>),
    /// Transport started re-establishing a lost session
    Reconnect,
    /// Transport failure; fails a pending handshake
    Error(String),
    /// Inbound message
    Message(Message),
}

impl TransportEvent {
    /// The lifecycle event this maps to, if any
    pub fn lifecycle(&self) -> Option<ConnectionEvent> {
        match self {
            TransportEvent::Connect => Some(ConnectionEvent::Connect),
            TransportEvent::Disconnect(_) => Some(ConnectionEvent::Disconnect),
            TransportEvent::Reconnect => Some(ConnectionEvent::Reconnect),
            TransportEvent::Error(_) => Some(ConnectionEvent::Error),
            TransportEvent::Message(_) => None,
        }
    }
}

/// Broker transport capability
///
/// `connect` starts a session attempt and returns once it is under way; the
/// outcome arrives as [`TransportEvent::Connect`] or [`TransportEvent::Error`].
/// Every other call applies to the current session. After each `connect` the
/// caller subscribes its filters again; a transport only replays filters on
/// reconnects it performs itself.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, address: &str, events: EventSender) -> Result<(), ConnectionError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ConnectionError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), ConnectionError>;

    /// Hand a message to the broker. Returns once the transport accepted it.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError>;

    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Host and port of a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `host`, `host:port`, `mqtt://host[:port]` or `tcp://host[:port]`
    pub fn parse(address: &str) -> Result<Self, ConnectionError> {
        let rest = match address.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(ConnectionError::Unreachable(format!(
                    "unsupported scheme '{}'",
                    scheme
                )))
            }
            None => address,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    ConnectionError::Unreachable(format!("invalid port '{}'", port_str))
                })?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(ConnectionError::Unreachable(format!(
                "missing host in '{}'",
                address
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("192.168.1.48", "192.168.1.48", 1883)]
    #[test_case("broker.example.com:8883", "broker.example.com", 8883)]
    #[test_case("mqtt://192.168.1.144", "192.168.1.144", 1883)]
    #[test_case("tcp://localhost:1884/", "localhost", 1884)]
    fn test_parse_address(input: &str, host: &str, port: u16) {
        let addr = BrokerAddress::parse(input).unwrap();
        assert_eq!(addr.host, host);
        assert_eq!(addr.port, port);
    }

    #[test_case("ws://localhost:8080")]
    #[test_case("localhost:notaport")]
    #[test_case("mqtt://:1883")]
    fn test_parse_address_invalid(input: &str) {
        assert!(matches!(
            BrokerAddress::parse(input),
            Err(ConnectionError::Unreachable(_))
        ));
    }

    #[test]
    fn test_lifecycle_mapping() {
        assert_eq!(
            TransportEvent::Disconnect(None).lifecycle(),
            Some(ConnectionEvent::Disconnect)
        );
        assert_eq!(
            TransportEvent::Message(Message::new("a", "b")).lifecycle(),
            None
        );
    }
}
