//! MQTT v5.0 reason codes
//!
//! Codes below 0x80 are successes, the rest are failures. The harness only
//! branches on a handful of them but has to decode whatever the broker sends
//! so the value can be logged and reported.

use std::fmt;

use super::QoS;

macro_rules! reason_codes {
    ($($name:ident = $value:literal => $text:literal,)*) => {
        /// Reason code carried by CONNACK, acks and DISCONNECT
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($name = $value,)*
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(ReasonCode::$name),)*
                    _ => None,
                }
            }

            fn text(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)*
                }
            }
        }
    };
}

reason_codes! {
    Success = 0x00 => "Success",
    GrantedQoS1 = 0x01 => "Granted QoS 1",
    GrantedQoS2 = 0x02 => "Granted QoS 2",
    DisconnectWithWill = 0x04 => "Disconnect with Will Message",
    NoMatchingSubscribers = 0x10 => "No matching subscribers",
    UnspecifiedError = 0x80 => "Unspecified error",
    MalformedPacket = 0x81 => "Malformed Packet",
    ProtocolError = 0x82 => "Protocol Error",
    ImplementationError = 0x83 => "Implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "Unsupported Protocol Version",
    ClientIdNotValid = 0x85 => "Client Identifier not valid",
    BadUserNameOrPassword = 0x86 => "Bad User Name or Password",
    NotAuthorized = 0x87 => "Not authorized",
    ServerUnavailable = 0x88 => "Server unavailable",
    ServerBusy = 0x89 => "Server busy",
    Banned = 0x8A => "Banned",
    ServerShuttingDown = 0x8B => "Server shutting down",
    KeepAliveTimeout = 0x8D => "Keep Alive timeout",
    SessionTakenOver = 0x8E => "Session taken over",
    TopicFilterInvalid = 0x8F => "Topic Filter invalid",
    TopicNameInvalid = 0x90 => "Topic Name invalid",
    PacketIdInUse = 0x91 => "Packet Identifier in use",
    PacketIdNotFound = 0x92 => "Packet Identifier not found",
    ReceiveMaxExceeded = 0x93 => "Receive Maximum exceeded",
    PacketTooLarge = 0x95 => "Packet too large",
    MessageRateTooHigh = 0x96 => "Message rate too high",
    QuotaExceeded = 0x97 => "Quota exceeded",
    AdministrativeAction = 0x98 => "Administrative action",
    PayloadFormatInvalid = 0x99 => "Payload format invalid",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "Use another server",
    SharedSubsNotSupported = 0x9E => "Shared Subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "Connection rate exceeded",
    MaximumConnectTime = 0xA0 => "Maximum connect time",
    WildcardSubsNotSupported = 0xA2 => "Wildcard Subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// Granted QoS carried by a successful SUBACK reason code
    pub fn granted_qos(self) -> Option<QoS> {
        match self {
            ReasonCode::Success => Some(QoS::AtMostOnce),
            ReasonCode::GrantedQoS1 => Some(QoS::AtLeastOnce),
            ReasonCode::GrantedQoS2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.text(), *self as u8)
    }
}
