//! Bridge error types

use std::fmt;
use std::time::Duration;

use crate::state::{ConnectionEvent, ConnectionState};

/// Transport-level connection failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Address could not be resolved or reached
    Unreachable(String),
    /// Broker rejected the handshake
    Rejected(String),
    /// Handshake did not complete in time
    HandshakeTimeout,
    /// Session dropped or the transport failed mid-operation
    Lost(String),
    /// Connection was already connected or connecting
    AlreadyConnected,
    /// Connection was shut down and cannot be reused
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Unreachable(msg) => write!(f, "Unreachable: {}", msg),
            ConnectionError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            ConnectionError::HandshakeTimeout => write!(f, "Handshake timed out"),
            ConnectionError::Lost(msg) => write!(f, "Connection lost: {}", msg),
            ConnectionError::AlreadyConnected => write!(f, "Already connected"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors returned by bridge operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Handshake or transport failure
    Connection(ConnectionError),
    /// Subscription pattern is malformed
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
    /// Topic name cannot be published to
    InvalidTopic {
        topic: String,
        reason: &'static str,
    },
    /// Publish attempted while not connected
    NotConnected(ConnectionState),
    /// None of the awaited events fired in time
    Timeout {
        events: Vec<ConnectionEvent>,
        after: Duration,
    },
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, BridgeError::NotConnected(_))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Connection(e) => write!(f, "Connection error: {}", e),
            BridgeError::InvalidPattern { pattern, reason } => {
                write!(f, "Invalid pattern '{}': {}", pattern, reason)
            }
            BridgeError::InvalidTopic { topic, reason } => {
                write!(f, "Invalid topic '{}': {}", topic, reason)
            }
            BridgeError::NotConnected(state) => write!(f, "Not connected (state: {})", state),
            BridgeError::Timeout { events, after } => {
                let names: Vec<_> = events.iter().map(|e| e.name()).collect();
                write!(
                    f,
                    "Timed out after {:?} waiting for {}",
                    after,
                    names.join(" or ")
                )
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for BridgeError {
    fn from(e: ConnectionError) -> Self {
        BridgeError::Connection(e)
    }
}

/// Failure reported by a message handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler failed: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
