//! MQTT v5.0 properties
//!
//! Only the properties a test client sends or inspects are modeled. Every
//! other identifier defined by v5.0 is still recognized on decode and skipped
//! according to its wire type, so a broker adding e.g. a content type or a
//! subscription identifier never breaks the client.

use bytes::{BufMut, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// How a property value is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

macro_rules! property_ids {
    ($($name:ident = $value:literal : $wire:ident,)*) => {
        /// Property identifiers (Table 2-4 of MQTT v5.0)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PropertyId {
            $($name = $value,)*
        }

        impl PropertyId {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(PropertyId::$name),)*
                    _ => None,
                }
            }

            fn wire_type(self) -> WireType {
                match self {
                    $(PropertyId::$name => WireType::$wire,)*
                }
            }
        }
    };
}

property_ids! {
    PayloadFormatIndicator = 0x01 : Byte,
    MessageExpiryInterval = 0x02 : FourByte,
    ContentType = 0x03 : Utf8,
    ResponseTopic = 0x08 : Utf8,
    CorrelationData = 0x09 : Binary,
    SubscriptionIdentifier = 0x0B : VarInt,
    SessionExpiryInterval = 0x11 : FourByte,
    AssignedClientIdentifier = 0x12 : Utf8,
    ServerKeepAlive = 0x13 : TwoByte,
    AuthenticationMethod = 0x15 : Utf8,
    AuthenticationData = 0x16 : Binary,
    RequestProblemInformation = 0x17 : Byte,
    WillDelayInterval = 0x18 : FourByte,
    RequestResponseInformation = 0x19 : Byte,
    ResponseInformation = 0x1A : Utf8,
    ServerReference = 0x1C : Utf8,
    ReasonString = 0x1F : Utf8,
    ReceiveMaximum = 0x21 : TwoByte,
    TopicAliasMaximum = 0x22 : TwoByte,
    TopicAlias = 0x23 : TwoByte,
    MaximumQoS = 0x24 : Byte,
    RetainAvailable = 0x25 : Byte,
    UserProperty = 0x26 : Utf8Pair,
    MaximumPacketSize = 0x27 : FourByte,
    WildcardSubscriptionAvailable = 0x28 : Byte,
    SubscriptionIdentifierAvailable = 0x29 : Byte,
    SharedSubscriptionAvailable = 0x2A : Byte,
}

/// The v5.0 properties the harness cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub message_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub server_keep_alive: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub shared_subscription_available: Option<u8>,
    pub assigned_client_identifier: Option<String>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Decode a length-prefixed property block. The returned count includes
    /// the prefix.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (block_len, prefix_len) = read_variable_int(buf)?;
        let end = prefix_len + block_len as usize;
        let mut rest = buf.get(prefix_len..end).ok_or(DecodeError::InsufficientData)?;

        let mut props = Properties::new();
        while let [raw_id, value @ ..] = rest {
            let id = PropertyId::from_u8(*raw_id).ok_or(DecodeError::InvalidPropertyId(*raw_id))?;
            let consumed = props.apply(id, value)?;
            rest = &value[consumed..];
        }

        Ok((props, end))
    }

    /// Store one property value if it is modeled; returns the bytes it occupied
    fn apply(&mut self, id: PropertyId, value: &[u8]) -> Result<usize, DecodeError> {
        use PropertyId::*;

        let consumed = match id.wire_type() {
            WireType::Byte => {
                let v = *value.first().ok_or(DecodeError::InsufficientData)?;
                match id {
                    MaximumQoS => self.maximum_qos = Some(v),
                    SharedSubscriptionAvailable => self.shared_subscription_available = Some(v),
                    _ => {}
                }
                1
            }
            WireType::TwoByte => {
                let v = read_u16(value)?;
                match id {
                    ReceiveMaximum if v == 0 => {
                        return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                    }
                    ReceiveMaximum => self.receive_maximum = Some(v),
                    TopicAliasMaximum => self.topic_alias_maximum = Some(v),
                    ServerKeepAlive => self.server_keep_alive = Some(v),
                    _ => {}
                }
                2
            }
            WireType::FourByte => {
                let v = read_u32(value)?;
                match id {
                    SessionExpiryInterval => self.session_expiry_interval = Some(v),
                    MessageExpiryInterval => self.message_expiry_interval = Some(v),
                    _ => {}
                }
                4
            }
            WireType::VarInt => read_variable_int(value)?.1,
            WireType::Utf8 => {
                let (s, len) = read_string(value)?;
                match id {
                    ReasonString => self.reason_string = Some(s.to_owned()),
                    AssignedClientIdentifier => self.assigned_client_identifier = Some(s.to_owned()),
                    _ => {}
                }
                len
            }
            WireType::Binary => read_binary(value)?.1,
            WireType::Utf8Pair => {
                let (key, key_len) = read_string(value)?;
                let (val, val_len) = read_string(&value[key_len..])?;
                self.user_properties.push((key.to_owned(), val.to_owned()));
                key_len + val_len
            }
        };
        Ok(consumed)
    }

    /// Encode the property block, length prefix included
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut block = BytesMut::new();

        let four_byte = [
            (PropertyId::SessionExpiryInterval, self.session_expiry_interval),
            (PropertyId::MessageExpiryInterval, self.message_expiry_interval),
        ];
        for (id, v) in four_byte {
            if let Some(v) = v {
                block.put_u8(id as u8);
                block.put_u32(v);
            }
        }

        let two_byte = [
            (PropertyId::ReceiveMaximum, self.receive_maximum),
            (PropertyId::TopicAliasMaximum, self.topic_alias_maximum),
            (PropertyId::ServerKeepAlive, self.server_keep_alive),
        ];
        for (id, v) in two_byte {
            if let Some(v) = v {
                block.put_u8(id as u8);
                block.put_u16(v);
            }
        }

        let one_byte = [
            (PropertyId::MaximumQoS, self.maximum_qos),
            (PropertyId::SharedSubscriptionAvailable, self.shared_subscription_available),
        ];
        for (id, v) in one_byte {
            if let Some(v) = v {
                block.put_u8(id as u8);
                block.put_u8(v);
            }
        }

        let strings = [
            (PropertyId::AssignedClientIdentifier, &self.assigned_client_identifier),
            (PropertyId::ReasonString, &self.reason_string),
        ];
        for (id, v) in strings {
            if let Some(s) = v {
                block.put_u8(id as u8);
                write_string(&mut block, s)?;
            }
        }

        for (key, value) in &self.user_properties {
            block.put_u8(PropertyId::UserProperty as u8);
            write_string(&mut block, key)?;
            write_string(&mut block, value)?;
        }

        let len = u32::try_from(block.len()).map_err(|_| EncodeError::PacketTooLarge)?;
        write_variable_int(buf, len)?;
        buf.put_slice(&block);
        Ok(())
    }
}
