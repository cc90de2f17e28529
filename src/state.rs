//! Connection State Model
//!
//! Lifecycle state of a bridge connection and the named transition events
//! that drive it.

use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected (initial state, and terminal after shutdown)
    #[default]
    Disconnected,
    /// Handshake in progress, or the transport is re-establishing a session
    Connecting,
    /// Connected and operational
    Connected,
    /// Graceful shutdown in progress
    Disconnecting,
    /// Handshake failed, a fresh connect is required
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// State recorded when the transport reports `event` while in `self`.
    ///
    /// Returns `None` when the event does not change the state.
    pub fn on_event(self, event: ConnectionEvent) -> Option<ConnectionState> {
        let next = match event {
            ConnectionEvent::Connect => ConnectionState::Connected,
            // A failed handshake stays failed until the next connect
            ConnectionEvent::Disconnect if self == ConnectionState::Failed => return None,
            ConnectionEvent::Disconnect | ConnectionEvent::Close => ConnectionState::Disconnected,
            ConnectionEvent::Reconnect => ConnectionState::Connecting,
            // Errors only fail a pending handshake; a live session reports
            // its loss through `disconnect`.
            ConnectionEvent::Error if self == ConnectionState::Connecting => {
                ConnectionState::Failed
            }
            ConnectionEvent::Error => return None,
        };
        (next != self).then_some(next)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Named state-transition events emitted on a connection's event surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Transport session established
    Connect,
    /// Transport session lost
    Disconnect,
    /// Transport started re-establishing a lost session
    Reconnect,
    /// Transport reported a failure
    Error,
    /// Connection shut down by its owner
    Close,
}

impl ConnectionEvent {
    pub const ALL: [ConnectionEvent; 5] = [
        ConnectionEvent::Connect,
        ConnectionEvent::Disconnect,
        ConnectionEvent::Reconnect,
        ConnectionEvent::Error,
        ConnectionEvent::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "connect",
            ConnectionEvent::Disconnect => "disconnect",
            ConnectionEvent::Reconnect => "reconnect",
            ConnectionEvent::Error => "error",
            ConnectionEvent::Close => "close",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown event name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEvent(pub String);

impl fmt::Display for UnknownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown connection event: {}", self.0)
    }
}

impl std::error::Error for UnknownEvent {}

impl FromStr for ConnectionEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionEvent::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ConnectionState::Disconnected, ConnectionEvent::Connect, Some(ConnectionState::Connected))]
    #[test_case(ConnectionState::Connecting, ConnectionEvent::Connect, Some(ConnectionState::Connected))]
    #[test_case(ConnectionState::Connected, ConnectionEvent::Disconnect, Some(ConnectionState::Disconnected))]
    #[test_case(ConnectionState::Connected, ConnectionEvent::Reconnect, Some(ConnectionState::Connecting))]
    #[test_case(ConnectionState::Connecting, ConnectionEvent::Error, Some(ConnectionState::Failed))]
    #[test_case(ConnectionState::Connected, ConnectionEvent::Error, None)]
    #[test_case(ConnectionState::Connected, ConnectionEvent::Connect, None)]
    #[test_case(ConnectionState::Disconnecting, ConnectionEvent::Close, Some(ConnectionState::Disconnected))]
    #[test_case(ConnectionState::Failed, ConnectionEvent::Disconnect, None)]
    #[test_case(ConnectionState::Failed, ConnectionEvent::Connect, Some(ConnectionState::Connected))]
    fn test_transitions(
        from: ConnectionState,
        event: ConnectionEvent,
        expected: Option<ConnectionState>,
    ) {
        assert_eq!(from.on_event(event), expected);
    }

    #[test]
    fn test_event_names_roundtrip() {
        for event in ConnectionEvent::ALL {
            assert_eq!(event.name().parse::<ConnectionEvent>().unwrap(), event);
        }
        assert!("message".parse::<ConnectionEvent>().is_err());
    }

    #[test]
    fn test_default_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::default().is_connected());
    }
}
