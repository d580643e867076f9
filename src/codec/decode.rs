//! Decoder for the packets a broker sends to a client

use std::sync::Arc;

use bytes::Bytes;

use super::{read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, DecodeError, Disconnect, Packet, Properties, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode, SubAck,
};

#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied, or `None`
    /// while the frame is still incomplete.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Ok(None);
        };
        let (remaining, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        if remaining as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let start = 1 + len_bytes;
        let end = start + remaining as usize;
        let Some(body) = buf.get(start..end) else {
            return Ok(None);
        };

        let flags = first_byte & 0x0F;
        let packet = match first_byte >> 4 {
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(decode_ack(flags, 0x00, body, |packet_id, reason_code, properties| {
                PubAck { packet_id, reason_code, properties }
            })?),
            5 => Packet::PubRec(decode_ack(flags, 0x00, body, |packet_id, reason_code, properties| {
                PubRec { packet_id, reason_code, properties }
            })?),
            6 => Packet::PubRel(decode_ack(flags, 0x02, body, |packet_id, reason_code, properties| {
                PubRel { packet_id, reason_code, properties }
            })?),
            7 => Packet::PubComp(decode_ack(flags, 0x00, body, |packet_id, reason_code, properties| {
                PubComp { packet_id, reason_code, properties }
            })?),
            9 => decode_suback(flags, body)?,
            13 => {
                expect_flags(flags, 0)?;
                Packet::PingResp
            }
            14 => decode_disconnect(flags, body)?,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, end)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidFlags)
    }
}

fn reason(byte: u8) -> Result<ReasonCode, DecodeError> {
    ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))
}

/// Properties that may be omitted entirely when nothing follows the reason code
fn trailing_properties(rest: &[u8]) -> Result<Properties, DecodeError> {
    if rest.is_empty() {
        Ok(Properties::default())
    } else {
        Properties::decode(rest).map(|(props, _)| props)
    }
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;
    let [ack_flags, code, rest @ ..] = body else {
        return Err(DecodeError::InsufficientData);
    };
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::MalformedPacket("invalid connack flags"));
    }

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        reason_code: reason(*code)?,
        properties: trailing_properties(rest)?,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    let dup = flags & 0x08 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let (topic, mut pos) = read_string(body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        }
    };
    let (properties, props_len) = Properties::decode(&body[pos..])?;
    pos += props_len;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain: flags & 0x01 != 0,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
        properties,
    }))
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout; the reason code
/// and properties may be absent.
fn decode_ack<T>(
    flags: u8,
    expected_flags: u8,
    body: &[u8],
    build: impl FnOnce(u16, ReasonCode, Properties) -> T,
) -> Result<T, DecodeError> {
    expect_flags(flags, expected_flags)?;
    let packet_id = read_u16(body)?;
    let (reason_code, properties) = match &body[2..] {
        [] => (ReasonCode::Success, Properties::default()),
        [code, rest @ ..] => (reason(*code)?, trailing_properties(rest)?),
    };
    Ok(build(packet_id, reason_code, properties))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;
    let packet_id = read_u16(body)?;
    let (properties, props_len) = Properties::decode(&body[2..])?;

    let reason_codes = body[2 + props_len..]
        .iter()
        .map(|&b| reason(b))
        .collect::<Result<Vec<_>, _>>()?;
    if reason_codes.is_empty() {
        return Err(DecodeError::MalformedPacket("suback without reason codes"));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        reason_codes,
        properties,
    }))
}

fn decode_disconnect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;
    let disconnect = match body {
        [] => Disconnect::default(),
        [code, rest @ ..] => Disconnect {
            reason_code: reason(*code)?,
            properties: trailing_properties(rest)?,
        },
    };
    Ok(Packet::Disconnect(disconnect))
}
