//! The client-side subset of MQTT v5.0 the harness speaks: the packets a
//! test client sends and receives, their reason codes and properties.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use properties::{Properties, PropertyId};
pub use reason::ReasonCode;

/// Protocol level byte for MQTT v5.0 in CONNECT
pub const PROTOCOL_LEVEL_V5: u8 = 5;

/// Delivery guarantee; ordered so `min` picks the weaker of two
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
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
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// SUBSCRIBE options byte
///
/// Test subscriptions only ever request a QoS. No Local, Retain As
/// Published and Retain Handling stay zero so retained messages are sent
/// at subscribe time, which the publisher topic never carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self { qos }
    }

    pub fn to_byte(self) -> u8 {
        self.qos as u8
    }
}
