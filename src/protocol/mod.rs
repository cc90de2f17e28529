//! MQTT Protocol definitions and types
//!
//! The MQTT v3.1.1 packet subset a client session needs: connection
//! handshake, publish with its acknowledgement flows, subscriptions,
//! keep-alive and disconnect.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError};
pub use packet::*;

/// Protocol level sent in CONNECT for MQTT v3.1.1
pub const PROTOCOL_LEVEL_V311: u8 = 4;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// CONNACK return codes (MQTT v3.1.1 section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUserNameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ConnectReturnCode::Accepted),
            0x01 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            0x02 => Some(ConnectReturnCode::IdentifierRejected),
            0x03 => Some(ConnectReturnCode::ServerUnavailable),
            0x04 => Some(ConnectReturnCode::BadUserNameOrPassword),
            0x05 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "Connection accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "Unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => write!(f, "Identifier rejected"),
            ConnectReturnCode::ServerUnavailable => write!(f, "Server unavailable"),
            ConnectReturnCode::BadUserNameOrPassword => write!(f, "Bad user name or password"),
            ConnectReturnCode::NotAuthorized => write!(f, "Not authorized"),
        }
    }
}

/// SUBACK return code for one requested filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckCode {
    /// Subscription accepted with this maximum QoS
    Granted(QoS),
    /// Subscription refused
    Failure,
}

impl SubAckCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x80 => Some(SubAckCode::Failure),
            v => QoS::from_u8(v).map(SubAckCode::Granted),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubAckCode::Granted(qos) => qos as u8,
            SubAckCode::Failure => 0x80,
        }
    }
}
