//! Client-side packet encoder
//!
//! Each packet body is written to a scratch buffer first so the remaining
//! length is known exactly before the fixed header goes out.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, Disconnect, EncodeError, Packet, Publish, QoS, ReasonCode, Subscribe,
    PROTOCOL_LEVEL_V5,
};

const CONNECT_USERNAME: u8 = 0x80;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_CLEAN_START: u8 = 0x02;

#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => frame(buf, 0x10, |body| connect_body(p, body)),
            Packet::Publish(p) => frame(buf, publish_header(p), |body| publish_body(p, body)),
            Packet::PubAck(p) => ack(buf, 0x40, p.packet_id, p.reason_code),
            Packet::PubRec(p) => ack(buf, 0x50, p.packet_id, p.reason_code),
            Packet::PubRel(p) => ack(buf, 0x62, p.packet_id, p.reason_code),
            Packet::PubComp(p) => ack(buf, 0x70, p.packet_id, p.reason_code),
            Packet::Subscribe(p) => frame(buf, 0x82, |body| subscribe_body(p, body)),
            Packet::PingReq => frame(buf, 0xC0, |_| Ok(())),
            Packet::Disconnect(p) => frame(buf, 0xE0, |body| disconnect_body(p, body)),
            other => Err(EncodeError::UnsupportedPacket(other.packet_type())),
        }
    }
}

/// Fixed header, remaining length, then the body `write` produced
fn frame<F>(buf: &mut BytesMut, first_byte: u8, write: F) -> Result<(), EncodeError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
{
    let mut body = BytesMut::new();
    write(&mut body)?;
    let len = u32::try_from(body.len()).map_err(|_| EncodeError::PacketTooLarge)?;

    buf.reserve(1 + 4 + body.len());
    buf.put_u8(first_byte);
    write_variable_int(buf, len)?;
    buf.put_slice(&body);
    Ok(())
}

fn connect_body(packet: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(body, "MQTT")?;
    body.put_u8(PROTOCOL_LEVEL_V5);

    let mut flags = 0u8;
    if packet.clean_start {
        flags |= CONNECT_CLEAN_START;
    }
    if packet.password.is_some() {
        flags |= CONNECT_PASSWORD;
    }
    if packet.username.is_some() {
        flags |= CONNECT_USERNAME;
    }
    body.put_u8(flags);
    body.put_u16(packet.keep_alive);
    packet.properties.encode(body)?;

    write_string(body, &packet.client_id)?;
    if let Some(username) = &packet.username {
        write_string(body, username)?;
    }
    if let Some(password) = &packet.password {
        write_binary(body, password)?;
    }
    Ok(())
}

fn publish_header(packet: &Publish) -> u8 {
    0x30 | ((packet.qos as u8) << 1) | ((packet.dup as u8) << 3) | packet.retain as u8
}

fn publish_body(packet: &Publish, body: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(body, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        body.put_u16(packet.packet_id.unwrap_or(0));
    }
    packet.properties.encode(body)?;
    body.put_slice(&packet.payload);
    Ok(())
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP. Success goes out in the two-byte
/// short form.
fn ack(
    buf: &mut BytesMut,
    first_byte: u8,
    packet_id: u16,
    reason_code: ReasonCode,
) -> Result<(), EncodeError> {
    frame(buf, first_byte, |body| {
        body.put_u16(packet_id);
        if reason_code != ReasonCode::Success {
            body.put_u8(reason_code as u8);
            body.put_u8(0x00);
        }
        Ok(())
    })
}

fn subscribe_body(packet: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
    body.put_u16(packet.packet_id);
    packet.properties.encode(body)?;
    for sub in &packet.subscriptions {
        write_string(body, &sub.filter)?;
        body.put_u8(sub.options.to_byte());
    }
    Ok(())
}

fn disconnect_body(packet: &Disconnect, body: &mut BytesMut) -> Result<(), EncodeError> {
    // Normal disconnection without properties has an empty body
    if packet.reason_code == ReasonCode::Success && packet.properties.is_empty() {
        return Ok(());
    }
    body.put_u8(packet.reason_code as u8);
    packet.properties.encode(body)
}
