//! MQTT v5.0 client over TCP
//!
//! Each connection runs one task that owns the socket. Operations reach it
//! through a command channel and wait on a oneshot for the broker's
//! acknowledgment, the same shape the connection loop of a bridge uses.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Interval};
use tracing::{debug, trace, warn};

use super::{
    ClientError, ClientEvent, Connection, ConnectOptions, Connector, EventSink, InboundMessage,
    PublishOptions,
};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    ReasonCode, Subscribe, Subscription, SubscriptionOptions,
};

const DEFAULT_PORT: u16 = 1883;
const READ_CHUNK: usize = 4096;

/// Parse a broker address
///
/// Accepts `mqtt://host:port`, `tcp://host:port`, `host:port` and `host`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ClientError> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let rest = rest.trim_end_matches('/');

    if rest.is_empty() || rest.contains("://") {
        return Err(ClientError::Protocol(format!(
            "invalid broker url '{}'",
            url
        )));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                ClientError::Protocol(format!("invalid port in broker url '{}'", url))
            })?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(ClientError::Protocol(format!(
            "missing host in broker url '{}'",
            url
        ))),
        None => Ok((rest.to_string(), DEFAULT_PORT)),
    }
}

/// Opens MQTT v5.0 connections to a broker over TCP
#[derive(Debug, Clone)]
pub struct WireConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    max_packet_size: usize,
}

impl WireConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let (host, port) = parse_broker_url(url)?;
        Ok(Self {
            host,
            port,
            connect_timeout,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// TCP connect, CONNECT, then read until the CONNACK arrives.
    /// Bytes received after the CONNACK are handed back for the task.
    async fn handshake(
        &self,
        options: &ConnectOptions,
        decoder: &Decoder,
    ) -> Result<(TcpStream, bool, BytesMut), ClientError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: options.client_id.clone(),
            clean_start: options.clean_start,
            keep_alive: options.keep_alive,
            username: options.username.clone(),
            password: options.password.as_ref().map(|p| Bytes::from(p.clone())),
            properties: Properties {
                session_expiry_interval: (options.session_expiry > 0)
                    .then_some(options.session_expiry),
                ..Default::default()
            },
        }));

        let mut buf = BytesMut::new();
        Encoder::new()
            .encode(&connect, &mut buf)
            .map_err(|e| ClientError::Protocol(format!("encode error: {}", e)))?;
        stream.write_all(&buf).await?;

        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            if let Some((packet, used)) = decoder
                .decode(&read_buf)
                .map_err(|e| ClientError::Protocol(format!("decode error: {}", e)))?
            {
                let _ = read_buf.split_to(used);
                return match packet {
                    Packet::ConnAck(connack) if connack.reason_code.is_success() => {
                        Ok((stream, connack.session_present, read_buf))
                    }
                    Packet::ConnAck(connack) => {
                        Err(ClientError::ConnectionRefused(connack.reason_code))
                    }
                    other => Err(ClientError::Protocol(format!(
                        "expected CONNACK, got packet type {}",
                        other.packet_type()
                    ))),
                };
            }

            let n = stream.read_buf(&mut read_buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionLost(
                    "connection closed before CONNACK".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl Connector for WireConnector {
    fn describe(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    async fn connect(
        &self,
        options: ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ClientError> {
        let decoder = Decoder::new().with_max_packet_size(self.max_packet_size);
        let (stream, session_present, leftover) =
            timeout(self.connect_timeout, self.handshake(&options, &decoder))
                .await
                .map_err(|_| ClientError::Timeout)??;

        debug!(
            "{}: connected to {}:{} (session_present={})",
            options.client_id, self.host, self.port, session_present
        );
        events.emit(ClientEvent::Connected { session_present });

        let (read_half, write_half) = stream.into_split();
        let (command_tx, command_rx) = mpsc::channel(256);
        let open = Arc::new(AtomicBool::new(true));

        let task = ConnectionTask {
            client_id: options.client_id,
            write_half,
            encoder: Encoder::new(),
            decoder,
            write_buf: BytesMut::new(),
            events,
            next_packet_id: 1,
            pending: AHashMap::new(),
            inbound_qos2: AHashSet::new(),
            awaiting_pingresp: false,
        };
        let keep_alive = options.keep_alive;
        let task_open = open.clone();
        tokio::spawn(async move {
            task.run(read_half, leftover, command_rx, keep_alive).await;
            task_open.store(false, Ordering::Release);
        });

        Ok(Box::new(WireConnection { command_tx, open }))
    }
}

/// Operations handed to the connection task
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        options: PublishOptions,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        reply: oneshot::Sender<Result<QoS, ClientError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// An outbound exchange waiting for the broker
enum PendingAck {
    PubAck(oneshot::Sender<Result<(), ClientError>>),
    PubRec(oneshot::Sender<Result<(), ClientError>>),
    PubComp(oneshot::Sender<Result<(), ClientError>>),
    SubAck(oneshot::Sender<Result<QoS, ClientError>>),
}

impl PendingAck {
    /// The caller stopped waiting, typically after an ack timeout
    fn is_abandoned(&self) -> bool {
        match self {
            PendingAck::PubAck(tx) | PendingAck::PubRec(tx) | PendingAck::PubComp(tx) => {
                tx.is_closed()
            }
            PendingAck::SubAck(tx) => tx.is_closed(),
        }
    }

    fn fail(self, err: ClientError) {
        match self {
            PendingAck::PubAck(tx) | PendingAck::PubRec(tx) | PendingAck::PubComp(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingAck::SubAck(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Next free packet identifier, cycling through 1..=65535.
///
/// An id whose caller gave up is reclaimed only when the counter comes back
/// round to it, or when every id is taken, so a late ack from the broker
/// cannot land on a fresh publish.
fn allocate_packet_id(pending: &mut AHashMap<u16, PendingAck>, next: &mut u16) -> Option<u16> {
    if pending.len() >= u16::MAX as usize {
        pending.retain(|_, ack| !ack.is_abandoned());
        if pending.len() >= u16::MAX as usize {
            return None;
        }
    }
    loop {
        let id = *next;
        *next = next.checked_add(1).unwrap_or(1);
        if id == 0 {
            continue;
        }
        match pending.get(&id) {
            None => return Some(id),
            Some(ack) if ack.is_abandoned() => {
                pending.remove(&id);
                return Some(id);
            }
            Some(_) => {}
        }
    }
}

/// How the connection task ended
enum Exit {
    /// Local disconnect completed
    Closed(Option<oneshot::Sender<Result<(), ClientError>>>),
    /// Every handle was dropped without a disconnect
    Abandoned,
    /// Broker sent DISCONNECT
    Peer(ReasonCode, Option<String>),
    /// Socket or protocol failure
    Failed(ClientError),
}

struct ConnectionTask {
    client_id: String,
    write_half: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    write_buf: BytesMut,
    events: EventSink,
    next_packet_id: u16,
    pending: AHashMap<u16, PendingAck>,
    /// Inbound QoS 2 ids received and not yet released
    inbound_qos2: AHashSet<u16>,
    awaiting_pingresp: bool,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut read_half: OwnedReadHalf,
        mut read_buf: BytesMut,
        mut command_rx: mpsc::Receiver<Command>,
        keep_alive: u16,
    ) {
        let mut keepalive_timer = (keep_alive > 0).then(|| {
            let period = Duration::from_secs(keep_alive as u64);
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        // Packets that arrived together with the CONNACK
        let exit = match self.drain_packets(&mut read_buf).await {
            Some(exit) => exit,
            None => loop {
                tokio::select! {
                    cmd = command_rx.recv() => {
                        let exit = match cmd {
                            Some(cmd) => self.handle_command(cmd).await,
                            None => Some(Exit::Abandoned),
                        };
                        if let Some(exit) = exit {
                            break exit;
                        }
                    }

                    result = read_half.read_buf(&mut read_buf) => {
                        match result {
                            Ok(0) => break Exit::Failed(ClientError::ConnectionLost(
                                "connection closed by broker".to_string(),
                            )),
                            Ok(_) => {
                                if let Some(exit) = self.drain_packets(&mut read_buf).await {
                                    break exit;
                                }
                            }
                            Err(e) => break Exit::Failed(ClientError::ConnectionLost(e.to_string())),
                        }
                    }

                    _ = tick(&mut keepalive_timer) => {
                        if self.awaiting_pingresp {
                            break Exit::Failed(ClientError::ConnectionLost(
                                "keep alive timeout".to_string(),
                            ));
                        }
                        self.awaiting_pingresp = true;
                        if let Err(e) = self.send(&Packet::PingReq).await {
                            break Exit::Failed(e);
                        }
                    }
                }
            },
        };

        self.finish(exit, &mut command_rx);
    }

    /// Fail everything still outstanding and report how the connection ended
    fn finish(mut self, exit: Exit, command_rx: &mut mpsc::Receiver<Command>) {
        let err = match &exit {
            Exit::Closed(_) | Exit::Abandoned => ClientError::Closed,
            Exit::Peer(code, _) => ClientError::ConnectionLost(format!("broker disconnect: {}", code)),
            Exit::Failed(e) => e.clone(),
        };
        for (_, pending) in self.pending.drain() {
            pending.fail(err.clone());
        }
        command_rx.close();
        while let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                Command::Publish { reply, .. } | Command::Disconnect { reply } => {
                    let _ = reply.send(Err(err.clone()));
                }
                Command::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }

        match exit {
            Exit::Closed(reply) => {
                debug!("{}: disconnected", self.client_id);
                self.events.emit(ClientEvent::Closed);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Exit::Abandoned => {
                debug!("{}: connection handle dropped", self.client_id);
            }
            Exit::Peer(reason_code, reason_string) => {
                warn!(
                    "{}: broker sent DISCONNECT ({})",
                    self.client_id, reason_code
                );
                self.events.emit(ClientEvent::DisconnectedByPeer {
                    reason_code,
                    reason_string,
                });
            }
            Exit::Failed(e) => {
                warn!("{}: connection failed: {}", self.client_id, e);
                self.events.emit(ClientEvent::Error(e.to_string()));
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ClientError::Protocol(format!("encode error: {}", e)))?;
        self.write_half
            .write_all(&self.write_buf)
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        allocate_packet_id(&mut self.pending, &mut self.next_packet_id)
    }

    async fn handle_command(&mut self, cmd: Command) -> Option<Exit> {
        match cmd {
            Command::Publish {
                topic,
                payload,
                options,
                reply,
            } => {
                let packet_id = if options.qos == QoS::AtMostOnce {
                    None
                } else {
                    match self.allocate_packet_id() {
                        Some(id) => Some(id),
                        None => {
                            let _ = reply.send(Err(ClientError::Protocol(
                                "packet identifiers exhausted".to_string(),
                            )));
                            return None;
                        }
                    }
                };

                let publish = Packet::Publish(Publish {
                    qos: options.qos,
                    topic: Arc::from(topic),
                    packet_id,
                    payload,
                    properties: Properties {
                        message_expiry_interval: options.message_expiry,
                        ..Default::default()
                    },
                    ..Default::default()
                });

                if let Err(e) = self.send(&publish).await {
                    let _ = reply.send(Err(e.clone()));
                    return Some(Exit::Failed(e));
                }

                match (options.qos, packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => {
                        self.pending.insert(id, PendingAck::PubAck(reply));
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        self.pending.insert(id, PendingAck::PubRec(reply));
                    }
                    _ => {
                        let _ = reply.send(Ok(()));
                    }
                }
                None
            }
            Command::Subscribe { filter, qos, reply } => {
                let Some(packet_id) = self.allocate_packet_id() else {
                    let _ = reply.send(Err(ClientError::Protocol(
                        "packet identifiers exhausted".to_string(),
                    )));
                    return None;
                };

                let subscribe = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription {
                        filter,
                        options: SubscriptionOptions::with_qos(qos),
                    }],
                    properties: Properties::default(),
                });

                if let Err(e) = self.send(&subscribe).await {
                    let _ = reply.send(Err(e.clone()));
                    return Some(Exit::Failed(e));
                }
                self.pending.insert(packet_id, PendingAck::SubAck(reply));
                None
            }
            Command::Disconnect { reply } => {
                let disconnect = Packet::Disconnect(Disconnect::default());
                if let Err(e) = self.send(&disconnect).await {
                    let _ = reply.send(Err(e.clone()));
                    return Some(Exit::Failed(e));
                }
                let _ = self.write_half.shutdown().await;
                Some(Exit::Closed(Some(reply)))
            }
        }
    }

    /// Decode and handle every complete packet in the buffer
    async fn drain_packets(&mut self, read_buf: &mut BytesMut) -> Option<Exit> {
        loop {
            let decoded = match self.decoder.decode(read_buf) {
                Ok(decoded) => decoded,
                Err(e) => {
                    return Some(Exit::Failed(ClientError::Protocol(format!(
                        "decode error: {}",
                        e
                    ))))
                }
            };
            let (packet, used) = decoded?;
            let _ = read_buf.split_to(used);

            if let Some(exit) = self.handle_packet(packet).await {
                return Some(exit);
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Option<Exit> {
        trace!("{}: received packet type {}", self.client_id, packet.packet_type());

        let result = match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(ack) => {
                self.complete(ack.packet_id, ack.reason_code);
                Ok(())
            }
            Packet::PubRec(rec) => self.handle_pubrec(rec).await,
            Packet::PubComp(comp) => {
                self.complete(comp.packet_id, comp.reason_code);
                Ok(())
            }
            Packet::PubRel(rel) => {
                self.inbound_qos2.remove(&rel.packet_id);
                self.send(&Packet::PubComp(PubComp::new(rel.packet_id))).await
            }
            Packet::SubAck(suback) => {
                if let Some(PendingAck::SubAck(reply)) = self.pending.remove(&suback.packet_id) {
                    let code = suback
                        .reason_codes
                        .first()
                        .copied()
                        .unwrap_or(ReasonCode::UnspecifiedError);
                    let result = code.granted_qos().ok_or(ClientError::Rejected(code));
                    let _ = reply.send(result);
                }
                Ok(())
            }
            Packet::PingResp => {
                self.awaiting_pingresp = false;
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                return Some(Exit::Peer(
                    disconnect.reason_code,
                    disconnect.properties.reason_string,
                ));
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected packet type {}",
                other.packet_type()
            ))),
        };

        result.err().map(Exit::Failed)
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), ClientError> {
        let message = InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            dup: publish.dup,
        };

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.events.emit(ClientEvent::Message(message));
                Ok(())
            }
            (QoS::AtLeastOnce, Some(id)) => {
                self.events.emit(ClientEvent::Message(message));
                self.send(&Packet::PubAck(PubAck::new(id))).await
            }
            (QoS::ExactlyOnce, Some(id)) => {
                // Retransmits of an unreleased id are the same message
                if self.inbound_qos2.insert(id) {
                    self.events.emit(ClientEvent::Message(message));
                } else {
                    debug!("{}: duplicate QoS 2 publish id {}", self.client_id, id);
                }
                self.send(&Packet::PubRec(PubRec::new(id))).await
            }
            _ => Err(ClientError::Protocol(
                "publish without packet identifier".to_string(),
            )),
        }
    }

    async fn handle_pubrec(&mut self, rec: PubRec) -> Result<(), ClientError> {
        match self.pending.remove(&rec.packet_id) {
            Some(PendingAck::PubRec(reply)) => {
                if rec.reason_code.is_error() {
                    let _ = reply.send(Err(ClientError::Rejected(rec.reason_code)));
                    return Ok(());
                }
                self.pending.insert(rec.packet_id, PendingAck::PubComp(reply));
                self.send(&Packet::PubRel(PubRel::new(rec.packet_id))).await
            }
            Some(other) => {
                self.pending.insert(rec.packet_id, other);
                Ok(())
            }
            // A PUBREC for an id we no longer track still needs its PUBREL
            None => self.send(&Packet::PubRel(PubRel::new(rec.packet_id))).await,
        }
    }

    /// Resolve a PUBACK or PUBCOMP
    fn complete(&mut self, packet_id: u16, reason_code: ReasonCode) {
        match self.pending.remove(&packet_id) {
            Some(PendingAck::PubAck(reply)) | Some(PendingAck::PubComp(reply)) => {
                let result = if reason_code.is_error() {
                    Err(ClientError::Rejected(reason_code))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Some(other) => {
                self.pending.insert(packet_id, other);
            }
            None => {
                debug!("{}: ack for unknown packet id {}", self.client_id, packet_id);
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

/// Handle to a connection task
struct WireConnection {
    command_tx: mpsc::Sender<Command>,
    open: Arc<AtomicBool>,
}

impl WireConnection {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

#[async_trait]
impl Connection for WireConnection {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, ClientError> {
        let filter = filter.to_string();
        self.request(|reply| Command::Subscribe { filter, qos, reply })
            .await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), ClientError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            options,
            reply,
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
