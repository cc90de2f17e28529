//! VibeBridge - pub/sub bridge over MQTT v3.1.1
//!
//! Wraps a broker session in a [`Connection`] that tracks its lifecycle,
//! fans inbound messages out to topic-pattern subscriptions, and lets callers
//! wait, with a bound, for lifecycle events such as `connect` or `disconnect`.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod message;
pub mod protocol;
pub mod state;
pub mod topic;
pub mod transport;
pub mod waiter;

pub use config::{BrokerConfig, Config};
pub use connection::{Connection, ConnectionOptions};
pub use dispatch::{HandlerFailure, SubscriptionHandle};
pub use error::{BridgeError, BridgeResult, ConnectionError, HandlerError};
pub use events::{EventSurface, ListenerGuard, ListenerId};
pub use message::{Message, PublishOptions};
pub use protocol::QoS;
pub use state::{ConnectionEvent, ConnectionState};
pub use topic::TopicPattern;
pub use transport::{MemoryHandle, MemoryTransport, MqttTransport, Transport, TransportEvent};
pub use waiter::{wait_for, WaitOutcome};
