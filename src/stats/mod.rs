//! Run-wide statistics
//!
//! One `RunStats` is created per run and shared by every publisher driver,
//! session controller and the stats reporter. Counters are prometheus types
//! so the final values can also be written as a text exposition file.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::fingerprint::now_micros;

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counters for one verification run
pub struct RunStats {
    registry: Registry,
    started: Instant,

    pub published: IntCounter,
    pub acked: IntCounter,
    pub publish_failures: IntCounter,
    pub received: IntCounter,
    pub anomalies: IntCounter,
    pub repeats: IntCounter,
    pub connects: IntCounter,
    pub reconnects: IntCounter,
    pub connect_failures: IntCounter,
    pub subscribers_active: IntGauge,
    pub delivery_latency: Histogram,

    /// Running count of publish attempts
    progress: watch::Sender<u64>,
}

impl RunStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let published = counter(
            &registry,
            "verify_publish_attempts_total",
            "Publish operations issued",
        )?;
        let acked = counter(
            &registry,
            "verify_publish_acked_total",
            "Publish operations acknowledged by the broker",
        )?;
        let publish_failures = counter(
            &registry,
            "verify_publish_failed_total",
            "Publish operations rejected or timed out",
        )?;
        let received = counter(
            &registry,
            "verify_messages_received_total",
            "Messages delivered to subscribers",
        )?;
        let anomalies = counter(
            &registry,
            "verify_payload_anomalies_total",
            "Delivered payloads without a parseable fingerprint",
        )?;
        let repeats = counter(
            &registry,
            "verify_repeat_deliveries_total",
            "Deliveries of a fingerprint the subscriber already held",
        )?;
        let connects = counter(
            &registry,
            "verify_connects_total",
            "Successful subscriber and publisher connects",
        )?;
        let reconnects = counter(
            &registry,
            "verify_reconnects_total",
            "Subscriber reconnects with the same identity",
        )?;
        let connect_failures = counter(
            &registry,
            "verify_connect_failures_total",
            "Connect or subscribe attempts that failed",
        )?;

        let subscribers_active = IntGauge::with_opts(Opts::new(
            "verify_subscribers_active",
            "Subscriber sessions currently active",
        ))?;
        registry.register(Box::new(subscribers_active.clone()))?;

        let delivery_latency = Histogram::with_opts(
            HistogramOpts::new(
                "verify_delivery_latency_seconds",
                "Time from publish call to delivery at a subscriber",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(delivery_latency.clone()))?;

        let (progress, _) = watch::channel(0);

        Ok(Self {
            registry,
            started: Instant::now(),
            published,
            acked,
            publish_failures,
            received,
            anomalies,
            repeats,
            connects,
            reconnects,
            connect_failures,
            subscribers_active,
            delivery_latency,
            progress,
        })
    }

    pub fn publish_attempted(&self) {
        self.published.inc();
        self.progress.send_modify(|n| *n += 1);
    }

    pub fn publish_acked(&self) {
        self.acked.inc();
    }

    pub fn publish_failed(&self) {
        self.publish_failures.inc();
    }

    /// A delivery reached a subscriber; `sent_micros` comes from the payload
    pub fn message_received(&self, sent_micros: Option<u64>) {
        self.received.inc();
        if let Some(sent) = sent_micros {
            let now = now_micros();
            if now >= sent {
                self.delivery_latency
                    .observe((now - sent) as f64 / 1_000_000.0);
            }
        }
    }

    /// Subscribe to the running publish-attempt count
    pub fn progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed().as_secs_f64();
        let latency_count = self.delivery_latency.get_sample_count();
        let latency_mean_ms = if latency_count > 0 {
            self.delivery_latency.get_sample_sum() / latency_count as f64 * 1000.0
        } else {
            0.0
        };
        let received = self.received.get();

        StatsSnapshot {
            published: self.published.get(),
            acked: self.acked.get(),
            publish_failed: self.publish_failures.get(),
            received,
            anomalies: self.anomalies.get(),
            repeats: self.repeats.get(),
            connects: self.connects.get(),
            reconnects: self.reconnects.get(),
            connect_failures: self.connect_failures.get(),
            latency_samples: latency_count,
            latency_mean_ms,
            elapsed_secs: elapsed,
            receive_rate: if elapsed > 0.0 {
                received as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub published: u64,
    pub acked: u64,
    pub publish_failed: u64,
    pub received: u64,
    pub anomalies: u64,
    pub repeats: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub latency_samples: u64,
    pub latency_mean_ms: f64,
    pub elapsed_secs: f64,
    pub receive_rate: f64,
}

/// Periodically logs throughput while a run is in progress
pub struct StatsReporter {
    handle: JoinHandle<()>,
}

impl StatsReporter {
    pub fn spawn(stats: Arc<RunStats>, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            let mut last_received = 0u64;
            loop {
                ticker.tick().await;
                let snap = stats.snapshot();
                let rate = (snap.received - last_received) as f64 / every.as_secs_f64();
                last_received = snap.received;
                info!(
                    "published={} acked={} failed={} received={} ({:.0} msg/s) reconnects={}",
                    snap.published,
                    snap.acked,
                    snap.publish_failed,
                    snap.received,
                    rate,
                    snap.reconnects
                );
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
