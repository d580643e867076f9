//! MQTT Packet Codec
//!
//! Client-side MQTT v5.0 codec: encodes what a test client sends and
//! decodes what a broker sends back.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four-byte variable byte integer can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum inbound packet size
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a variable byte integer, returning the value and its encoded length
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    // Four continuation bytes is malformed; fewer means the rest is in flight
    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

#[inline]
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let len = variable_int_len(value);
    let mut rest = value;
    for _ in 1..len {
        buf.put_u8((rest & 0x7F) as u8 | 0x80);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
    Ok(len)
}

#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

fn fixed<const N: usize>(buf: &[u8]) -> Result<[u8; N], DecodeError> {
    buf.get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::InsufficientData)
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    fixed(buf).map(u16::from_be_bytes)
}

#[inline]
pub fn read_u32(buf: &[u8]) -> Result<u32, DecodeError> {
    fixed(buf).map(u32::from_be_bytes)
}

/// Length-prefixed bytes; returns the data and the bytes consumed
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let data = buf
        .get(2..2 + len)
        .ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Length-prefixed UTF-8 without U+0000
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, used) = read_binary(buf)?;
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains null character"));
    }
    Ok((text, used))
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
