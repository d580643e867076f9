//! Protocol Client Abstraction
//!
//! The harness drives brokers through these traits and never touches the
//! wire directly. Two implementations ship with the crate:
//! - `WireConnector`: MQTT v5.0 over TCP against a real broker
//! - `LoopbackBroker`: an in-process broker double for dry runs and tests
//!
//! Asynchronous events (inbound messages, connection loss) flow back through
//! an [`EventSink`] handed to `connect`. A sink is stamped with the
//! generation of the connection it belongs to so that late events from a
//! superseded connection can be told apart from the current one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{QoS, ReasonCode};

pub mod loopback;
pub mod wire;

pub use loopback::{LoopbackBroker, LoopbackFault};
pub use wire::WireConnector;

/// Error type for client operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Operation timed out
    Timeout,
    /// CONNACK carried a failure reason code
    ConnectionRefused(ReasonCode),
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker acknowledged with a failure reason code
    Rejected(ReasonCode),
    /// Broker violated the protocol
    Protocol(String),
    /// Socket error
    Io(String),
    /// Connection already closed locally
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "Operation timed out"),
            ClientError::ConnectionRefused(code) => write!(f, "Connection refused: {}", code),
            ClientError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ClientError::Rejected(code) => write!(f, "Rejected: {}", code),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::Io(msg) => write!(f, "IO error: {}", msg),
            ClientError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

/// Options for opening one physical connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier; the broker resumes sessions by this value
    pub client_id: String,
    /// Clean start; false asks the broker to resume the stored session
    pub clean_start: bool,
    /// Session expiry interval in seconds
    pub session_expiry: u32,
    /// Keep alive in seconds
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_start: true,
            session_expiry: 0,
            keep_alive: 60,
            username: None,
            password: None,
        }
    }

    /// Persistent session: clean start off, session kept for `expiry` seconds
    pub fn persistent(mut self, session_expiry: u32) -> Self {
        self.clean_start = false;
        self.session_expiry = session_expiry;
        self
    }

    pub fn credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Per-publish options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    /// Message expiry interval in seconds
    pub message_expiry: Option<u32>,
}

/// An application message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub dup: bool,
}

/// Lifecycle and delivery events emitted by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// CONNACK accepted
    Connected { session_present: bool },
    /// Application message arrived
    Message(InboundMessage),
    /// Connection closed after a local disconnect
    Closed,
    /// Connection failed unexpectedly
    Error(String),
    /// Broker sent DISCONNECT
    DisconnectedByPeer {
        reason_code: ReasonCode,
        reason_string: Option<String>,
    },
}

/// An event stamped with the generation of the connection that produced it
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: ClientEvent,
}

/// Sender side of a connection's event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Create a sink together with the receiver for its events
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emit an event; returns false once the receiving side is gone
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Opens physical connections to the broker under test
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Short description for logs (broker URL or "loopback")
    fn describe(&self) -> String;

    /// Open a connection and complete the CONNECT/CONNACK exchange
    async fn connect(
        &self,
        options: ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ClientError>;
}

/// One established connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribe and wait for SUBACK; returns the granted QoS
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, ClientError>;

    /// Publish and wait for the QoS-appropriate acknowledgment
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), ClientError>;

    /// Graceful close. The broker keeps the session (no unsubscribe).
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Bound an operation with a timeout, mapping expiry to `ClientError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ClientError>
where
    F: std::future::Future<Output = Result<T, ClientError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ClientError::Timeout)?
}
