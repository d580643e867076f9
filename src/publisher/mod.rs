//! Publisher Driver
//!
//! A driver owns one logical publisher identity. It connects, signals
//! readiness, waits for the orchestrator's start gate, then issues its
//! numbered sequence of fingerprinted publishes at a fixed pace.
//! Acknowledgments are awaited concurrently so broker round-trips never
//! stretch the pacing. A failed publish is counted and the sequence moves on.

use std::fmt;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{with_timeout, ClientError, ConnectOptions, Connection, EventSink, PublishOptions};
use crate::context::RunContext;
use crate::fingerprint::{now_micros, Fingerprint};
use crate::protocol::QoS;

/// Publisher driver errors
#[derive(Debug, Clone)]
pub enum PublisherError {
    /// Could not connect to the broker
    Connect {
        identity: String,
        source: ClientError,
    },
    /// The start gate was dropped before it opened
    Cancelled { identity: String },
}

impl fmt::Display for PublisherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublisherError::Connect { identity, source } => {
                write!(f, "{}: connect failed: {}", identity, source)
            }
            PublisherError::Cancelled { identity } => {
                write!(f, "{}: cancelled before publishing", identity)
            }
        }
    }
}

impl std::error::Error for PublisherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublisherError::Connect { source, .. } => Some(source),
            PublisherError::Cancelled { .. } => None,
        }
    }
}

/// What one publisher sends
#[derive(Debug, Clone)]
pub struct PublisherSpec {
    pub identity: String,
    pub topic: String,
    pub messages: u64,
    pub qos: QoS,
    /// Delay between successive publish calls
    pub interval: Duration,
    /// Message expiry interval in seconds
    pub message_expiry: Option<u32>,
    /// Append the send time to each payload for latency measurement
    pub timestamps: bool,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub keep_alive: u16,
    /// Upper bound on publishes awaiting acknowledgment
    pub max_inflight: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            keep_alive: 60,
            max_inflight: 100,
            username: None,
            password: None,
        }
    }
}

/// Outcome of one publisher's sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherReport {
    pub publisher: String,
    pub attempted: u64,
    pub acked: u64,
    pub failed: u64,
}

pub struct PublisherDriver {
    spec: PublisherSpec,
    settings: PublisherSettings,
    ctx: RunContext,
    ready: watch::Sender<bool>,
    completed: watch::Sender<bool>,
}

impl PublisherDriver {
    pub fn new(spec: PublisherSpec, settings: PublisherSettings, ctx: RunContext) -> Self {
        Self {
            spec,
            settings,
            ctx,
            ready: watch::channel(false).0,
            completed: watch::channel(false).0,
        }
    }

    pub fn identity(&self) -> &str {
        &self.spec.identity
    }

    /// Flips to true once connected. Closed without flipping if connect fails.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Flips to true once every sequence number has been attempted
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }

    /// Connect, wait for the start gate, publish the whole sequence
    pub async fn run(self, mut start: watch::Receiver<bool>) -> Result<PublisherReport, PublisherError> {
        let identity = self.spec.identity.clone();

        // Publishers hold no session state worth resuming
        let options = ConnectOptions::new(identity.clone())
            .keep_alive(self.settings.keep_alive)
            .credentials(self.settings.username.clone(), self.settings.password.clone());
        let (sink, _events) = EventSink::channel(0);
        let connection = match with_timeout(
            self.settings.connect_timeout,
            self.ctx.connector.connect(options, sink),
        )
        .await
        {
            Ok(connection) => connection,
            Err(source) => {
                self.ctx.stats.connect_failures.inc();
                return Err(PublisherError::Connect { identity, source });
            }
        };
        self.ctx.stats.connects.inc();
        self.ready.send_replace(true);
        debug!("{}: connected, waiting for start", identity);

        if start.wait_for(|open| *open).await.is_err() {
            let _ = with_timeout(self.settings.connect_timeout, connection.disconnect()).await;
            return Err(PublisherError::Cancelled { identity });
        }

        let report = self.publish_sequence(connection.as_ref()).await;

        if let Err(e) = with_timeout(self.settings.connect_timeout, connection.disconnect()).await {
            debug!("{}: disconnect after publishing failed: {}", identity, e);
        }
        self.completed.send_replace(true);
        info!(
            "{}: attempted={} acked={} failed={}",
            identity, report.attempted, report.acked, report.failed
        );
        Ok(report)
    }

    async fn publish_sequence(&self, connection: &dyn Connection) -> PublisherReport {
        let mut report = PublisherReport {
            publisher: self.spec.identity.clone(),
            ..Default::default()
        };
        let options = PublishOptions {
            qos: self.spec.qos,
            message_expiry: self.spec.message_expiry,
        };
        let max_inflight = self.settings.max_inflight.max(1);

        let mut ticker = (!self.spec.interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(self.spec.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut inflight = FuturesUnordered::new();
        let mut next = 1u64;

        while next <= self.spec.messages {
            if inflight.len() >= max_inflight {
                if let Some(result) = inflight.next().await {
                    self.tally(&mut report, result);
                }
                continue;
            }

            tokio::select! {
                _ = pace(&mut ticker) => {
                    let fp = Fingerprint::new(self.spec.identity.as_str(), next);
                    let payload = if self.spec.timestamps {
                        fp.to_timed_payload(now_micros())
                    } else {
                        fp.to_payload()
                    };
                    self.ctx.stats.publish_attempted();
                    report.attempted += 1;
                    let ack_timeout = self.settings.ack_timeout;
                    let topic = self.spec.topic.as_str();
                    inflight.push(async move {
                        (next, with_timeout(ack_timeout, connection.publish(topic, payload, options)).await)
                    });
                    next += 1;
                }
                Some(result) = inflight.next(), if !inflight.is_empty() => {
                    self.tally(&mut report, result);
                }
            }
        }

        while let Some(result) = inflight.next().await {
            self.tally(&mut report, result);
        }
        report
    }

    fn tally(&self, report: &mut PublisherReport, (sequence, result): (u64, Result<(), ClientError>)) {
        match result {
            Ok(()) => {
                report.acked += 1;
                self.ctx.stats.publish_acked();
            }
            Err(e) => {
                report.failed += 1;
                self.ctx.stats.publish_failed();
                if report.failed == 1 {
                    warn!("{}: publish #{} failed: {}", self.spec.identity, sequence, e);
                } else {
                    debug!("{}: publish #{} failed: {}", self.spec.identity, sequence, e);
                }
            }
        }
    }
}

/// Wait for the next pacing tick; unpaced drivers never wait
async fn pace(ticker: &mut Option<Interval>) {
    if let Some(ticker) = ticker {
        ticker.tick().await;
    }
}
