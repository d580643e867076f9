//! In-process broker double
//!
//! Implements just enough broker behavior to exercise the harness without a
//! network: persistent sessions keyed by client identity with expiry, offline
//! queues, session takeover, plain and `$share` subscriptions with
//! round-robin group delivery. Every acknowledgment is immediate.
//!
//! Two fault knobs make the verdict paths testable: dropping every n-th
//! delivery, and delivering shared messages to two group members.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    ClientError, ClientEvent, Connection, ConnectOptions, Connector, EventSink, InboundMessage,
    PublishOptions,
};
use crate::protocol::{QoS, ReasonCode};
use crate::topic::{
    parse_shared_subscription, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

/// Misbehavior injected into the loopback broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackFault {
    /// Silently drop every n-th delivery
    pub drop_every: Option<u64>,
    /// Deliver each shared message to two members of the group
    pub duplicate_shared: bool,
}

/// An in-process MQTT broker double
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    fault: LoopbackFault,
    deliveries: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    sessions: AHashMap<String, SessionState>,
    /// Round-robin cursor per (group, filter)
    share_cursors: AHashMap<(String, String), usize>,
    /// Every subscribe filter per client identity, in order
    subscribe_log: AHashMap<String, Vec<String>>,
    refused: AHashSet<String>,
    next_conn_id: u64,
}

struct LiveConnection {
    conn_id: u64,
    sink: EventSink,
}

struct QueuedMessage {
    message: InboundMessage,
    expires_at: Option<Instant>,
}

struct SessionState {
    session_expiry: u32,
    /// filter -> granted QoS
    subscriptions: AHashMap<String, QoS>,
    live: Option<LiveConnection>,
    queue: VecDeque<QueuedMessage>,
    disconnected_at: Option<Instant>,
}

impl SessionState {
    fn new(session_expiry: u32) -> Self {
        Self {
            session_expiry,
            subscriptions: AHashMap::new(),
            live: None,
            queue: VecDeque::new(),
            disconnected_at: None,
        }
    }

    fn is_online(&self) -> bool {
        self.live.is_some()
    }

    fn expired(&self, now: Instant) -> bool {
        match (self.live.is_some(), self.disconnected_at) {
            (false, Some(at)) => {
                now.duration_since(at) >= Duration::from_secs(self.session_expiry as u64)
            }
            _ => false,
        }
    }

    /// Hand a message to the live connection, or queue it while offline
    fn deliver(&mut self, message: InboundMessage, expires_at: Option<Instant>) {
        match &self.live {
            Some(live) => {
                live.sink.emit(ClientEvent::Message(message));
            }
            None if message.qos != QoS::AtMostOnce => {
                self.queue.push_back(QueuedMessage {
                    message,
                    expires_at,
                });
            }
            None => {}
        }
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(fault: LoopbackFault) -> Self {
        Self {
            inner: Arc::new(Inner {
                fault,
                ..Default::default()
            }),
        }
    }

    /// Refuse future connections from this client identity
    pub fn refuse(&self, client_id: &str) {
        self.inner.state.lock().refused.insert(client_id.to_string());
    }

    /// Subscribe filters issued by a client identity, in order
    pub fn subscribe_log(&self, client_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .subscribe_log
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .sessions
            .get(client_id)
            .is_some_and(SessionState::is_online)
    }

    /// Number of sessions the broker currently holds (online or not)
    pub fn session_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| !s.expired(now))
            .count()
    }

    /// Messages queued for an offline session
    pub fn queued_for(&self, client_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .get(client_id)
            .map_or(0, |s| s.queue.len())
    }

    /// Cut a client's connection as if the network failed
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(session) = state.sessions.get_mut(client_id) else {
            return false;
        };
        let Some(live) = session.live.take() else {
            return false;
        };
        session.disconnected_at = Some(Instant::now());
        live.sink
            .emit(ClientEvent::Error("connection reset".to_string()));
        if session.session_expiry == 0 {
            state.sessions.remove(client_id);
        }
        true
    }

    fn should_drop(&self) -> bool {
        let n = self.inner.deliveries.fetch_add(1, Ordering::Relaxed) + 1;
        matches!(self.inner.fault.drop_every, Some(every) if every > 0 && n % every == 0)
    }

    fn route(&self, topic: &str, payload: Bytes, options: PublishOptions) {
        let now = Instant::now();
        let expires_at = options
            .message_expiry
            .map(|secs| now + Duration::from_secs(secs as u64));

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.sessions.retain(|_, s| !s.expired(now));

        // Plain subscribers, and the members of every matching share group
        let mut plain: Vec<(String, QoS)> = Vec::new();
        let mut groups: AHashMap<(String, String), Vec<(String, QoS)>> = AHashMap::new();
        for (client_id, session) in &state.sessions {
            for (filter, granted) in &session.subscriptions {
                match parse_shared_subscription(filter) {
                    Some((group, base)) if topic_matches_filter(topic, base) => {
                        groups
                            .entry((group.to_string(), base.to_string()))
                            .or_default()
                            .push((client_id.clone(), *granted));
                    }
                    Some(_) => {}
                    None if topic_matches_filter(topic, filter) => {
                        plain.push((client_id.clone(), *granted));
                    }
                    None => {}
                }
            }
        }

        let mut targets = plain;
        for (key, mut members) in groups {
            members.sort();
            let cursor = state.share_cursors.entry(key).or_insert(0);
            let start = *cursor % members.len();
            // Prefer the next online member in rotation
            let chosen = (0..members.len())
                .map(|i| (start + i) % members.len())
                .find(|&i| {
                    state
                        .sessions
                        .get(&members[i].0)
                        .is_some_and(SessionState::is_online)
                })
                .unwrap_or(start);
            *cursor = chosen + 1;
            targets.push(members[chosen].clone());
            if self.inner.fault.duplicate_shared && members.len() > 1 {
                targets.push(members[(chosen + 1) % members.len()].clone());
            }
        }

        let topic: Arc<str> = Arc::from(topic);
        for (client_id, granted) in targets {
            if self.should_drop() {
                trace!("loopback: dropping delivery to {}", client_id);
                continue;
            }
            if let Some(session) = state.sessions.get_mut(&client_id) {
                session.deliver(
                    InboundMessage {
                        topic: topic.clone(),
                        payload: payload.clone(),
                        qos: options.qos.min(granted),
                        dup: false,
                    },
                    expires_at,
                );
            }
        }
    }
}

#[async_trait]
impl Connector for LoopbackBroker {
    fn describe(&self) -> String {
        "loopback".to_string()
    }

    async fn connect(
        &self,
        options: ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ClientError> {
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if state.refused.contains(&options.client_id) {
            return Err(ClientError::ConnectionRefused(ReasonCode::NotAuthorized));
        }

        state.next_conn_id += 1;
        let conn_id = state.next_conn_id;

        let resumable = state
            .sessions
            .get(&options.client_id)
            .is_some_and(|s| !s.expired(now));

        // Session takeover: the previous connection is told it was replaced
        if let Some(old) = state
            .sessions
            .get_mut(&options.client_id)
            .and_then(|s| s.live.take())
        {
            debug!("loopback: {} taken over", options.client_id);
            old.sink.emit(ClientEvent::DisconnectedByPeer {
                reason_code: ReasonCode::SessionTakenOver,
                reason_string: None,
            });
        }

        if options.clean_start || !resumable {
            state.sessions.insert(
                options.client_id.clone(),
                SessionState::new(options.session_expiry),
            );
        }
        let session_present = resumable && !options.clean_start;

        let session = state
            .sessions
            .entry(options.client_id.clone())
            .or_insert_with(|| SessionState::new(options.session_expiry));
        session.session_expiry = options.session_expiry;
        session.disconnected_at = None;

        events.emit(ClientEvent::Connected { session_present });
        let queued = std::mem::take(&mut session.queue);
        let mut redelivered = 0usize;
        for queued in queued {
            if queued.expires_at.is_some_and(|at| at <= now) {
                continue;
            }
            events.emit(ClientEvent::Message(queued.message));
            redelivered += 1;
        }
        session.live = Some(LiveConnection {
            conn_id,
            sink: events,
        });

        debug!(
            "loopback: {} connected (session_present={}, redelivered={})",
            options.client_id, session_present, redelivered
        );

        Ok(Box::new(LoopbackConnection {
            broker: self.clone(),
            client_id: options.client_id,
            conn_id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackConnection {
    broker: LoopbackBroker,
    client_id: String,
    conn_id: u64,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn ensure_current(&self) -> Result<(), ClientError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, ClientError> {
        self.ensure_current()?;
        validate_topic_filter(filter)
            .map_err(|_| ClientError::Rejected(ReasonCode::TopicFilterInvalid))?;

        let mut state = self.broker.inner.state.lock();
        state
            .subscribe_log
            .entry(self.client_id.clone())
            .or_default()
            .push(filter.to_string());
        if let Some(session) = state.sessions.get_mut(&self.client_id) {
            session.subscriptions.insert(filter.to_string(), qos);
        }
        Ok(qos)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), ClientError> {
        self.ensure_current()?;
        validate_topic_name(topic)
            .map_err(|_| ClientError::Rejected(ReasonCode::TopicNameInvalid))?;
        self.broker.route(topic, payload, options);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed);
        }

        let mut state = self.broker.inner.state.lock();
        let mut remove = false;
        if let Some(session) = state.sessions.get_mut(&self.client_id) {
            if session.live.as_ref().is_some_and(|l| l.conn_id == self.conn_id) {
                if let Some(live) = session.live.take() {
                    live.sink.emit(ClientEvent::Closed);
                }
                session.disconnected_at = Some(Instant::now());
                remove = session.session_expiry == 0;
            }
        }
        if remove {
            state.sessions.remove(&self.client_id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.broker
            .inner
            .state
            .lock()
            .sessions
            .get(&self.client_id)
            .and_then(|s| s.live.as_ref())
            .is_some_and(|l| l.conn_id == self.conn_id)
    }
}
