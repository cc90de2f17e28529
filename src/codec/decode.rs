//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubAckCode, Subscribe, Subscription, UnsubAck, Unsubscribe,
    PROTOCOL_LEVEL_V311,
};

/// MQTT v3.1.1 Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer
    ///
    /// Returns `Ok(None)` until a complete packet is buffered, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => Packet::PubAck(PubAck {
                packet_id: self.decode_packet_id(flags, 0, payload)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: self.decode_packet_id(flags, 0, payload)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: self.decode_packet_id(flags, 0x02, payload)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: self.decode_packet_id(flags, 0, payload)?,
            }),
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: self.decode_packet_id(flags, 0, payload)?,
            }),
            12 => {
                Self::expect_empty(flags, payload)?;
                Packet::PingReq
            }
            13 => {
                Self::expect_empty(flags, payload)?;
                Packet::PingResp
            }
            14 => {
                Self::expect_empty(flags, payload)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn expect_empty(flags: u8, payload: &[u8]) -> Result<(), DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !payload.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected payload"));
        }
        Ok(())
    }

    fn decode_packet_id(
        &self,
        flags: u8,
        expected_flags: u8,
        payload: &[u8],
    ) -> Result<u16, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("expected packet identifier only"));
        }
        read_u16(payload)
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;
        let (protocol_name, len) = read_string(payload)?;
        pos += len;
        if protocol_name != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }

        if payload.len() < pos + 4 {
            return Err(DecodeError::InsufficientData);
        }
        let level = payload[pos];
        if level != PROTOCOL_LEVEL_V311 {
            return Err(DecodeError::InvalidProtocolLevel(level));
        }
        let connect_flags = payload[pos + 1];
        if connect_flags & 0x01 != 0 {
            return Err(DecodeError::MalformedPacket("reserved connect flag set"));
        }
        // Will messages are not part of this client's packet subset
        if connect_flags & 0x3C != 0 {
            return Err(DecodeError::MalformedPacket("will message not supported"));
        }
        let keep_alive = read_u16(&payload[pos + 2..])?;
        pos += 4;

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let username = if connect_flags & 0x80 != 0 {
            let (username, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if connect_flags & 0x40 != 0 {
            let (password, len) = read_binary(&payload[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        if pos != payload.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session: connect_flags & 0x02 != 0,
            keep_alive,
            username,
            password,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 is valid (session present), rest must be 0
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code = ConnectReturnCode::from_u8(payload[1])
            .ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;

        // Validate topic (no wildcards allowed in PUBLISH)
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        let mut subscriptions = Vec::new();

        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            if options & 0xFC != 0 {
                return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = read_u16(payload)?;
        let return_codes = payload[2..]
            .iter()
            .map(|&code| SubAckCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        let mut filters = Vec::new();

        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
