//! Codec errors

use std::fmt;

/// A broker frame the client could not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed before the value can be read
    InsufficientData,
    /// Unknown type, or one a broker never sends to a client
    InvalidPacketType(u8),
    InvalidRemainingLength,
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the configured maximum packet size
    PacketTooLarge,
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "unexpected packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("malformed remaining length"),
            Self::InvalidQoS(q) => write!(f, "QoS {} is out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidPropertyId(id) => write!(f, "unknown property identifier 0x{:02X}", id),
            Self::InvalidFlags => f.write_str("reserved header flags are wrong"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => f.write_str("packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "unknown reason code 0x{:02X}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A client packet that cannot be put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// Packet type a client never sends
    UnsupportedPacket(u8),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet too large"),
            Self::StringTooLong => f.write_str("string too long"),
            Self::UnsupportedPacket(t) => write!(f, "packet type {} is not sent by clients", t),
        }
    }
}

impl std::error::Error for EncodeError {}
