//! Session Controller
//!
//! A controller owns one logical subscriber identity for the whole run. The
//! identity outlives any physical connection: the broker resumes the
//! persistent session by client id, so disconnect and reconnect keep
//! recording into the same ledger bucket.
//!
//! State machine:
//! ```text
//! Disconnected -> Connecting -> Subscribing -> Active
//! Active -> Disconnecting -> Disconnected
//! Active -> ConnectionLost -> Reconnecting -> Subscribing -> Active
//! ```
//!
//! Every physical connection gets an event sink tagged with a fresh
//! generation. One router task drains the controller's event channel for its
//! whole life; messages are recorded whatever the generation or state, while
//! loss events only count when they come from the current generation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use compact_str::CompactString;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{
    with_timeout, ClientError, ClientEvent, ConnectOptions, Connection, EventSink,
    InboundMessage, TaggedEvent,
};
use crate::context::RunContext;
use crate::fingerprint::{DeliveryKey, Fingerprint};
use crate::ledger::Recorded;
use crate::protocol::QoS;
use crate::topic::shared_filter;

#[cfg(test)]
mod tests;

/// Lifecycle of one subscriber identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Active,
    Disconnecting,
    ConnectionLost,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribing => "subscribing",
            SessionState::Active => "active",
            SessionState::Disconnecting => "disconnecting",
            SessionState::ConnectionLost => "connection-lost",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Session controller errors
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Connect was refused, failed or timed out
    Connect {
        identity: String,
        source: ClientError,
    },
    /// Subscribe was rejected, failed or timed out
    Subscribe {
        identity: String,
        source: ClientError,
    },
    /// A bounded wait for a state ran out
    Timeout {
        identity: String,
        waiting_for: SessionState,
        current: SessionState,
    },
}

impl SessionError {
    pub fn identity(&self) -> &str {
        match self {
            SessionError::Connect { identity, .. }
            | SessionError::Subscribe { identity, .. }
            | SessionError::Timeout { identity, .. } => identity,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Connect { identity, source } => {
                write!(f, "{}: connect failed: {}", identity, source)
            }
            SessionError::Subscribe { identity, source } => {
                write!(f, "{}: subscribe failed: {}", identity, source)
            }
            SessionError::Timeout {
                identity,
                waiting_for,
                current,
            } => write!(
                f,
                "{}: timed out waiting for {} (still {})",
                identity, waiting_for, current
            ),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Connect { source, .. } | SessionError::Subscribe { source, .. } => {
                Some(source)
            }
            SessionError::Timeout { .. } => None,
        }
    }
}

/// Who the controller is and what it subscribes to
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub identity: String,
    /// Shared-subscription group, if any
    pub group: Option<String>,
    pub base_topic: String,
    pub qos: QoS,
    /// Session expiry interval in seconds
    pub session_expiry: u32,
}

impl SessionSpec {
    /// `$share/<group>/<base>` for group members, the base topic otherwise
    pub fn filter(&self) -> String {
        match &self.group {
            Some(group) => shared_filter(group, &self.base_topic),
            None => self.base_topic.clone(),
        }
    }
}

/// Timeouts and reconnect policy
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Reconnect on unexpected connection loss
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            keep_alive: 60,
            username: None,
            password: None,
            auto_reconnect: false,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(10),
        }
    }
}

/// Owns one logical subscriber identity across its connections
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    spec: SessionSpec,
    filter: String,
    settings: SessionSettings,
    ctx: RunContext,
    state: watch::Sender<SessionState>,
    /// The bound connection; the lock also serializes lifecycle operations
    connection: AsyncMutex<Option<Box<dyn Connection>>>,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<TaggedEvent>,
    disconnected_at: Mutex<Option<Instant>>,
    expiry_exceeded: AtomicBool,
    torn_down: AtomicBool,
    connects: AtomicU64,
    subscribe_attempts: AtomicU64,
    last_filter: Mutex<Option<String>>,
}

impl SessionController {
    /// Create the controller and start its event router.
    /// Must be called from within a tokio runtime.
    pub fn new(spec: SessionSpec, settings: SessionSettings, ctx: RunContext) -> Self {
        ctx.ledger.register(&spec.identity, spec.group.as_deref());

        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);
        let inner = Arc::new(Inner {
            filter: spec.filter(),
            spec,
            settings,
            ctx: ctx.clone(),
            state,
            connection: AsyncMutex::new(None),
            generation: AtomicU64::new(0),
            events,
            disconnected_at: Mutex::new(None),
            expiry_exceeded: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            subscribe_attempts: AtomicU64::new(0),
            last_filter: Mutex::new(None),
        });

        let identity = CompactString::from(inner.spec.identity.as_str());
        tokio::spawn(route_events(Arc::downgrade(&inner), identity, ctx, event_rx));

        Self { inner }
    }

    pub fn identity(&self) -> &str {
        &self.inner.spec.identity
    }

    pub fn group(&self) -> Option<&str> {
        self.inner.spec.group.as_deref()
    }

    /// Topic filter this controller subscribes to
    pub fn filter(&self) -> &str {
        &self.inner.filter
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Whether any reconnect came after the session-expiry window had passed
    pub fn expiry_exceeded(&self) -> bool {
        self.inner.expiry_exceeded.load(Ordering::Acquire)
    }

    /// Successful connect+subscribe sequences
    pub fn connects(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    pub fn subscribe_attempts(&self) -> u64 {
        self.inner.subscribe_attempts.load(Ordering::Relaxed)
    }

    pub fn last_filter(&self) -> Option<String> {
        self.inner.last_filter.lock().clone()
    }

    /// Open the persistent session and subscribe. No-op when already active.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut slot = self.inner.connection.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        self.inner.torn_down.store(false, Ordering::Release);
        self.inner.set_state(SessionState::Connecting);
        self.inner.establish(&mut slot, false).await
    }

    /// Gracefully close the connection, leaving the broker-side session in
    /// place. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.connection.lock().await;
        self.inner.close(&mut slot).await;
    }

    /// Open a new connection with the same identity. The broker should
    /// redeliver what it queued while the identity was offline.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        let mut slot = self.inner.connection.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        self.inner.torn_down.store(false, Ordering::Release);
        self.inner.note_resume_gap();
        self.inner.set_state(SessionState::Reconnecting);
        self.inner.establish(&mut slot, true).await
    }

    /// Final disconnect at the end of the run; stops any automatic reconnect
    pub async fn teardown(&self) {
        self.inner.torn_down.store(true, Ordering::Release);
        self.disconnect().await;
    }

    /// Wait until the controller reaches `target`
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        limit: Duration,
    ) -> Result<(), SessionError> {
        let mut rx = self.inner.state.subscribe();
        let result = match tokio::time::timeout(limit, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(SessionError::Timeout {
                identity: self.inner.spec.identity.clone(),
                waiting_for: target,
                current: self.state(),
            }),
        };
        result
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.spec.identity, previous, state);
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.spec.identity.clone())
            .persistent(self.spec.session_expiry)
            .keep_alive(self.settings.keep_alive)
            .credentials(self.settings.username.clone(), self.settings.password.clone())
    }

    /// Connect, subscribe, bind. Shared by the initial connect and every
    /// reconnect. Caller holds the connection lock.
    async fn establish(
        &self,
        slot: &mut Option<Box<dyn Connection>>,
        resume: bool,
    ) -> Result<(), SessionError> {
        let identity = &self.spec.identity;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let sink = EventSink::new(generation, self.events.clone());

        let connection = match with_timeout(
            self.settings.connect_timeout,
            self.ctx.connector.connect(self.connect_options(), sink),
        )
        .await
        {
            Ok(connection) => connection,
            Err(source) => {
                self.ctx.stats.connect_failures.inc();
                self.set_state(SessionState::Disconnected);
                return Err(SessionError::Connect {
                    identity: identity.clone(),
                    source,
                });
            }
        };

        self.set_state(SessionState::Subscribing);
        self.subscribe_attempts.fetch_add(1, Ordering::Relaxed);
        *self.last_filter.lock() = Some(self.filter.clone());

        match with_timeout(
            self.settings.subscribe_timeout,
            connection.subscribe(&self.filter, self.spec.qos),
        )
        .await
        {
            Ok(granted) if granted < self.spec.qos => {
                warn!(
                    "{}: broker granted QoS {} for '{}', requested {}",
                    identity, granted, self.filter, self.spec.qos
                );
            }
            Ok(_) => {}
            Err(source) => {
                self.ctx.stats.connect_failures.inc();
                // Events from this connection are stale from here on
                self.generation.fetch_add(1, Ordering::AcqRel);
                let _ = with_timeout(self.settings.connect_timeout, connection.disconnect()).await;
                self.set_state(SessionState::Disconnected);
                return Err(SessionError::Subscribe {
                    identity: identity.clone(),
                    source,
                });
            }
        }

        *slot = Some(connection);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.ctx.stats.connects.inc();
        if resume {
            self.ctx.stats.reconnects.inc();
        }
        self.ctx.stats.subscribers_active.inc();
        self.set_state(SessionState::Active);
        debug!("{}: subscribed to '{}'", identity, self.filter);
        Ok(())
    }

    async fn close(&self, slot: &mut Option<Box<dyn Connection>>) {
        let Some(connection) = slot.take() else {
            self.set_state(SessionState::Disconnected);
            return;
        };

        self.set_state(SessionState::Disconnecting);
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = with_timeout(self.settings.connect_timeout, connection.disconnect()).await {
            warn!("{}: disconnect did not complete cleanly: {}", self.spec.identity, e);
        }
        *self.disconnected_at.lock() = Some(Instant::now());
        self.ctx.stats.subscribers_active.dec();
        self.set_state(SessionState::Disconnected);
    }

    /// Flag a reconnect that comes after the session-expiry window
    fn note_resume_gap(&self) {
        let Some(at) = *self.disconnected_at.lock() else {
            return;
        };
        let gap = at.elapsed();
        let window = Duration::from_secs(self.spec.session_expiry as u64);
        if gap > window {
            self.expiry_exceeded.store(true, Ordering::Release);
            warn!(
                "{}: reconnecting {:.1}s after disconnect, beyond the {}s session expiry; \
                 missing messages are expected",
                self.spec.identity,
                gap.as_secs_f64(),
                self.spec.session_expiry
            );
        }
    }

    /// React to loss of the connection with the given generation
    async fn handle_loss(self: Arc<Self>, generation: u64) {
        {
            let mut slot = self.connection.lock().await;
            if generation != self.generation.load(Ordering::Acquire) {
                return;
            }
            if slot.take().is_some() {
                self.ctx.stats.subscribers_active.dec();
            }
            *self.disconnected_at.lock() = Some(Instant::now());
            self.set_state(SessionState::ConnectionLost);
        }

        if !self.settings.auto_reconnect {
            return;
        }

        let mut backoff = self.settings.reconnect_backoff;
        for attempt in 1..=self.settings.reconnect_attempts {
            tokio::time::sleep(backoff).await;
            if self.torn_down.load(Ordering::Acquire) {
                return;
            }

            let mut slot = self.connection.lock().await;
            if slot.is_some() {
                return;
            }
            self.note_resume_gap();
            self.set_state(SessionState::Reconnecting);
            match self.establish(&mut slot, true).await {
                Ok(()) => {
                    info!(
                        "{}: reconnected after connection loss (attempt {})",
                        self.spec.identity, attempt
                    );
                    return;
                }
                Err(e) => warn!("{} (attempt {})", e, attempt),
            }
            backoff = std::cmp::min(backoff * 2, self.settings.reconnect_backoff_max);
        }

        error!(
            "{}: giving up after {} reconnect attempts",
            self.spec.identity, self.settings.reconnect_attempts
        );
    }
}

/// Drain one controller's event channel for its whole life
async fn route_events(
    inner: Weak<Inner>,
    identity: CompactString,
    ctx: RunContext,
    mut events: mpsc::UnboundedReceiver<TaggedEvent>,
) {
    while let Some(TaggedEvent { generation, event }) = events.recv().await {
        match event {
            ClientEvent::Message(message) => record_message(&identity, &ctx, &message),
            ClientEvent::Connected { session_present } => {
                debug!(
                    "{}: connection {} up (session_present={})",
                    identity, generation, session_present
                );
            }
            ClientEvent::Closed => {
                debug!("{}: connection {} closed", identity, generation);
            }
            ClientEvent::Error(reason) => on_loss(&inner, &identity, generation, reason),
            ClientEvent::DisconnectedByPeer {
                reason_code,
                reason_string,
            } => {
                let reason = match reason_string {
                    Some(text) => format!("broker disconnect: {} ({})", reason_code, text),
                    None => format!("broker disconnect: {}", reason_code),
                };
                on_loss(&inner, &identity, generation, reason);
            }
        }
    }
}

fn on_loss(inner: &Weak<Inner>, identity: &str, generation: u64, reason: String) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if generation != inner.generation.load(Ordering::Acquire) {
        debug!(
            "{}: ignoring loss of superseded connection {}: {}",
            identity, generation, reason
        );
        return;
    }
    warn!("{}: connection lost: {}", identity, reason);
    tokio::spawn(inner.handle_loss(generation));
}

fn record_message(identity: &str, ctx: &RunContext, message: &InboundMessage) {
    let key = match Fingerprint::parse(&message.payload) {
        Some((fp, sent)) => {
            ctx.stats.message_received(sent);
            DeliveryKey::Fingerprint(fp)
        }
        None => {
            ctx.stats.message_received(None);
            ctx.stats.anomalies.inc();
            let key = DeliveryKey::from_payload(&message.payload);
            warn!(
                "{}: payload on '{}' has no fingerprint, kept as {}",
                identity, message.topic, key
            );
            key
        }
    };

    if ctx.ledger.record(identity, key) == Recorded::Repeat {
        ctx.stats.repeats.inc();
    }
}
