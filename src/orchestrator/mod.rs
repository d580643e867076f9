//! Scenario Orchestrator
//!
//! Drives one verification run through its phases:
//!
//! ```text
//! Init -> AwaitSubscriberReady -> AwaitPublisherReady -> Publishing
//!      -> [FaultInjection] -> Draining -> Verifying -> Reporting -> Done
//! ```
//!
//! No publish is issued before every subscriber holds an acknowledged
//! subscription and every publisher is connected. Fault injection fires once
//! the run-wide publish count crosses the configured fraction of the
//! expected universe, and runs alongside the publishers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::client::Connector;
use crate::config::{Config, ConfigError};
use crate::context::RunContext;
use crate::fingerprint::ExpectedUniverse;
use crate::protocol::QoS;
use crate::publisher::{PublisherDriver, PublisherReport, PublisherSettings, PublisherSpec};
use crate::report::{Anomaly, NullSink, Report, ReportError, ReportSink, RunSummary};
use crate::session::{SessionController, SessionSettings, SessionSpec, SessionState};
use crate::stats::{RunStats, StatsReporter, StatsSnapshot};
use crate::verdict::{Outcome, Subject, Verdict, VerdictEngine};

pub mod fault;
pub mod launcher;

pub use fault::{FaultAction, FaultMode, FaultOutcome, FaultPlan};
pub use launcher::BatchLauncher;


/// Run phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    AwaitSubscriberReady,
    AwaitPublisherReady,
    Publishing,
    FaultInjection,
    Draining,
    Verifying,
    Reporting,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::AwaitSubscriberReady => "await-subscriber-ready",
            Phase::AwaitPublisherReady => "await-publisher-ready",
            Phase::Publishing => "publishing",
            Phase::FaultInjection => "fault-injection",
            Phase::Draining => "draining",
            Phase::Verifying => "verifying",
            Phase::Reporting => "reporting",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// When a phase was entered, relative to the start of the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    #[serde(with = "humantime_serde")]
    pub started_after: Duration,
}

/// Run errors. Verification failures are not errors; they are in the verdict.
#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    Stats(prometheus::Error),
    /// Every client of one role failed to connect
    AllConnectionsFailed { role: &'static str, attempted: usize },
    /// A readiness barrier was not reached in time
    BarrierTimeout {
        phase: Phase,
        limit: Duration,
        pending: usize,
    },
    /// Publishers did not finish within the publish-phase bound
    PublishTimeout { limit: Duration },
    Report(ReportError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "{}", e),
            RunError::Stats(e) => write!(f, "Stats error: {}", e),
            RunError::AllConnectionsFailed { role, attempted } => {
                write!(f, "All {} {} connections failed", attempted, role)
            }
            RunError::BarrierTimeout {
                phase,
                limit,
                pending,
            } => write!(
                f,
                "{} not reached within {:?} ({} client(s) pending)",
                phase, limit, pending
            ),
            RunError::PublishTimeout { limit } => {
                write!(f, "Publishing did not finish within {:?}", limit)
            }
            RunError::Report(e) => write!(f, "Report error: {}", e),
        }
    }
}

impl std::error::Error for RunError {}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        RunError::Config(e)
    }
}

impl From<prometheus::Error> for RunError {
    fn from(e: prometheus::Error) -> Self {
        RunError::Stats(e)
    }
}

impl From<ReportError> for RunError {
    fn from(e: ReportError) -> Self {
        RunError::Report(e)
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: Verdict,
    pub stats: StatsSnapshot,
    pub phases: Vec<PhaseTiming>,
    pub summary: RunSummary,
}

pub fn subscriber_identity(prefix: &str, index: usize) -> String {
    format!("{}-sub-{}", prefix, index)
}

pub fn group_name(group_prefix: &str, index: usize) -> String {
    format!("{}-{}", group_prefix, index)
}

pub fn group_member_identity(prefix: &str, group: &str, index: usize) -> String {
    format!("{}-{}-sub-{}", prefix, group, index)
}

pub fn publisher_identity(prefix: &str, index: usize) -> String {
    format!("{}-pub-{}", prefix, index)
}

/// Publish count at which faults fire; at least one publish in
pub fn trigger_count(total: u64, threshold: f64) -> u64 {
    ((total as f64 * threshold).ceil() as u64).max(1)
}

/// Subscriber identities and filters for the configured mode
pub fn plan_subscribers(config: &Config, qos: QoS) -> Vec<SessionSpec> {
    let scenario = &config.scenario;
    let spec = |identity: String, group: Option<String>| SessionSpec {
        identity,
        group,
        base_topic: scenario.topic.clone(),
        qos,
        session_expiry: scenario.session_expiry,
    };

    if config.shared.groups == 0 {
        return (0..scenario.subscribers)
            .map(|i| spec(subscriber_identity(&scenario.prefix, i), None))
            .collect();
    }

    (0..config.shared.groups)
        .flat_map(|g| {
            let group = group_name(&config.shared.group_prefix, g);
            (0..config.shared.group_size).map(move |j| (group.clone(), j))
        })
        .map(|(group, j)| {
            spec(
                group_member_identity(&scenario.prefix, &group, j),
                Some(group),
            )
        })
        .collect()
}

pub fn plan_publishers(config: &Config, qos: QoS) -> Vec<PublisherSpec> {
    let scenario = &config.scenario;
    (0..scenario.publishers)
        .map(|i| PublisherSpec {
            identity: publisher_identity(&scenario.prefix, i),
            topic: scenario.topic.clone(),
            messages: scenario.messages_per_publisher,
            qos,
            interval: scenario.publish_interval,
            message_expiry: scenario.message_expiry,
            timestamps: scenario.timestamps,
        })
        .collect()
}

fn session_settings(config: &Config) -> SessionSettings {
    SessionSettings {
        connect_timeout: config.timeouts.connect,
        subscribe_timeout: config.timeouts.subscribe,
        keep_alive: config.broker.keep_alive,
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
        auto_reconnect: config.fault.auto_reconnect,
        reconnect_attempts: config.fault.reconnect_attempts,
        reconnect_backoff: config.fault.reconnect_backoff,
        reconnect_backoff_max: config.fault.reconnect_backoff_max,
    }
}

fn publisher_settings(config: &Config) -> PublisherSettings {
    PublisherSettings {
        connect_timeout: config.timeouts.connect,
        ack_timeout: config.timeouts.ack,
        keep_alive: config.broker.keep_alive,
        max_inflight: config.scenario.max_inflight,
        username: config.broker.username.clone(),
        password: config.broker.password.clone(),
    }
}

/// Phase log shared with the fault task
struct PhaseTracker {
    current: watch::Sender<Phase>,
    log: Mutex<Vec<PhaseTiming>>,
    started: Instant,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: watch::channel(Phase::Init).0,
            log: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    fn enter(&self, phase: Phase) {
        let started_after = self.started.elapsed();
        self.log.lock().push(PhaseTiming {
            phase,
            started_after,
        });
        self.current.send_replace(phase);
        info!("Phase: {} (+{:.1}s)", phase, started_after.as_secs_f64());
    }

    fn timings(&self) -> Vec<PhaseTiming> {
        self.log.lock().clone()
    }
}

async fn teardown_all(controllers: &[SessionController]) {
    join_all(controllers.iter().map(|c| c.teardown())).await;
}

/// Runs one scenario against one broker
pub struct Orchestrator {
    config: Config,
    connector: Arc<dyn Connector>,
    sink: Box<dyn ReportSink>,
    tracker: Arc<PhaseTracker>,
}

impl Orchestrator {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            sink: Box::new(NullSink),
            tracker: Arc::new(PhaseTracker::new()),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Follows the current phase
    pub fn phase_receiver(&self) -> watch::Receiver<Phase> {
        self.tracker.current.subscribe()
    }

    pub async fn run(self) -> Result<RunOutcome, RunError> {
        let Orchestrator {
            config,
            connector,
            mut sink,
            tracker,
        } = self;

        tracker.enter(Phase::Init);
        config.validate()?;
        let qos = config.qos().ok_or_else(|| {
            ConfigError::Validation("scenario.qos must be 0, 1, or 2".to_string())
        })?;

        let stats = Arc::new(RunStats::new()?);
        let ctx = RunContext::new(connector.clone(), stats.clone());
        let reporter = (!config.timeouts.stats_interval.is_zero())
            .then(|| StatsReporter::spawn(stats.clone(), config.timeouts.stats_interval));
        let launcher = BatchLauncher::new(config.launch.batch_size, config.launch.batch_delay);

        info!(
            "Verifying {}: {} subscriber(s){}, {} publisher(s) x {} messages, QoS {}",
            connector.describe(),
            config.subscriber_count(),
            if config.shared.groups > 0 {
                format!(" in {} shared group(s)", config.shared.groups)
            } else {
                String::new()
            },
            config.scenario.publishers,
            config.scenario.messages_per_publisher,
            qos
        );

        // Subscribers
        tracker.enter(Phase::AwaitSubscriberReady);
        let settings = session_settings(&config);
        let controllers: Vec<SessionController> = plan_subscribers(&config, qos)
            .into_iter()
            .map(|spec| SessionController::new(spec, settings.clone(), ctx.clone()))
            .collect();

        let mut connect_failures = Vec::new();
        let limit = config.timeouts.subscriber_ready;
        let results = match tokio::time::timeout(
            limit,
            launcher.launch(controllers.iter().cloned(), |c| async move { c.connect().await }),
        )
        .await
        {
            Ok(results) => results,
            Err(_) => {
                let pending = controllers
                    .iter()
                    .filter(|c| c.state() != SessionState::Active)
                    .count();
                teardown_all(&controllers).await;
                return Err(RunError::BarrierTimeout {
                    phase: Phase::AwaitSubscriberReady,
                    limit,
                    pending,
                });
            }
        };

        let mut active = Vec::new();
        for (controller, result) in controllers.iter().zip(results) {
            match result {
                Ok(()) => active.push(controller.clone()),
                Err(e) => {
                    warn!("{}", e);
                    connect_failures.push(e.to_string());
                }
            }
        }
        if active.is_empty() {
            return Err(RunError::AllConnectionsFailed {
                role: "subscriber",
                attempted: controllers.len(),
            });
        }
        info!("{}/{} subscribers active", active.len(), controllers.len());

        // Publishers
        tracker.enter(Phase::AwaitPublisherReady);
        let (gate, gate_rx) = watch::channel(false);
        let pub_settings = publisher_settings(&config);
        let drivers = plan_publishers(&config, qos)
            .into_iter()
            .map(|spec| PublisherDriver::new(spec, pub_settings.clone(), ctx.clone()));
        let attempted = config.scenario.publishers;

        let limit = config.timeouts.publisher_ready;
        let launched = match tokio::time::timeout(
            limit,
            launcher.launch(drivers, |driver| {
                let mut ready = driver.ready();
                let identity = driver.identity().to_string();
                let handle = tokio::spawn(driver.run(gate_rx.clone()));
                async move {
                    let connected = ready.wait_for(|r| *r).await.is_ok();
                    (identity, connected, handle)
                }
            }),
        )
        .await
        {
            Ok(launched) => launched,
            Err(_) => {
                // Dropping the gate cancels every publisher still waiting on it
                drop(gate);
                teardown_all(&controllers).await;
                return Err(RunError::BarrierTimeout {
                    phase: Phase::AwaitPublisherReady,
                    limit,
                    pending: attempted,
                });
            }
        };

        let mut ready_ids = Vec::new();
        let mut handles = Vec::new();
        for (identity, connected, handle) in launched {
            if connected {
                ready_ids.push(identity);
                handles.push(handle);
                continue;
            }
            match handle.await {
                Ok(Err(e)) => {
                    warn!("{}", e);
                    connect_failures.push(e.to_string());
                }
                Ok(Ok(_)) => {}
                Err(e) => {
                    warn!("{}: publisher task failed: {}", identity, e);
                    connect_failures.push(format!("{}: {}", identity, e));
                }
            }
        }
        if ready_ids.is_empty() {
            teardown_all(&controllers).await;
            return Err(RunError::AllConnectionsFailed {
                role: "publisher",
                attempted,
            });
        }

        let universe = ExpectedUniverse::new(ready_ids, config.scenario.messages_per_publisher);
        info!(
            "{}/{} publishers ready, expecting {} messages per subject",
            universe.publishers().len(),
            attempted,
            universe.len()
        );

        // Fault injection waits on the publish count
        let trigger = trigger_count(universe.len() as u64, config.fault.threshold);
        let fault_task = config.fault.enabled.then(|| {
            let targets = fault::select_targets(&active);
            let plan = FaultPlan::from(&config.fault);
            let mut progress = stats.progress();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                progress.wait_for(|n| *n >= trigger).await.ok()?;
                tracker.enter(Phase::FaultInjection);
                info!("{} publishes issued, injecting faults", trigger);
                Some(fault::inject(plan, targets).await)
            })
        });

        // Publishing
        tracker.enter(Phase::Publishing);
        gate.send_replace(true);

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let limit = config.timeouts.publish_phase;
        let finished = match tokio::time::timeout(limit, join_all(handles)).await {
            Ok(finished) => finished,
            Err(_) => {
                aborts.iter().for_each(|a| a.abort());
                if let Some(task) = &fault_task {
                    task.abort();
                }
                teardown_all(&controllers).await;
                return Err(RunError::PublishTimeout { limit });
            }
        };

        let mut publishers: Vec<PublisherReport> = Vec::new();
        for result in finished {
            match result {
                Ok(Ok(report)) => publishers.push(report),
                Ok(Err(e)) => warn!("{}", e),
                Err(e) => warn!("Publisher task failed: {}", e),
            }
        }

        let triggered = *stats.progress().borrow() >= trigger;
        let fault = match fault_task {
            Some(task) if triggered => task.await.ok().flatten(),
            Some(task) => {
                warn!("Fault trigger of {} publishes never reached", trigger);
                task.abort();
                None
            }
            None => None,
        };

        // Draining
        tracker.enter(Phase::Draining);
        tokio::time::sleep(config.timeouts.drain).await;

        // Verifying
        tracker.enter(Phase::Verifying);
        teardown_all(&controllers).await;
        let subjects = subjects_for(&controllers);
        let verdict = VerdictEngine::new(ctx.ledger.clone(), universe).evaluate(&subjects);

        // Reporting
        tracker.enter(Phase::Reporting);
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        let anomalies: Vec<Anomaly> = ctx
            .ledger
            .subscribers()
            .into_iter()
            .flat_map(|id| {
                ctx.ledger
                    .anomalies_for(&id)
                    .into_iter()
                    .map(move |raw| Anomaly {
                        subscriber: id.to_string(),
                        payload: raw.to_string(),
                    })
            })
            .collect();

        let snapshot = stats.snapshot();
        let summary = RunSummary {
            passed: verdict.passed(),
            broker: connector.describe(),
            universe_size: verdict.universe_size,
            subjects: verdict.subjects.clone(),
            publishers,
            stats: snapshot.clone(),
            phases: tracker.timings(),
            fault,
            connect_failures,
            anomalies,
            metrics: Some(stats.render()?),
        };

        sink.write_report(Report::new(verdict.rows.clone()))?;
        sink.write_summary(&summary)?;
        log_verdict(&verdict, &summary);

        tracker.enter(Phase::Done);
        Ok(RunOutcome {
            verdict,
            stats: snapshot,
            phases: tracker.timings(),
            summary,
        })
    }
}

/// One subject per plain subscriber, one per shared group
fn subjects_for(controllers: &[SessionController]) -> Vec<Subject> {
    let mut subjects = Vec::new();
    let mut groups: BTreeMap<String, (Vec<String>, bool)> = BTreeMap::new();

    for controller in controllers {
        match controller.group() {
            None => subjects.push(Subject::Subscriber {
                id: controller.identity().to_string(),
                expiry_exceeded: controller.expiry_exceeded(),
            }),
            Some(group) => {
                let (members, expired) = groups.entry(group.to_string()).or_default();
                members.push(controller.identity().to_string());
                *expired |= controller.expiry_exceeded();
            }
        }
    }

    subjects.extend(groups.into_iter().map(|(name, (members, expiry_exceeded))| {
        Subject::Group {
            name,
            members,
            expiry_exceeded,
        }
    }));
    subjects
}

fn log_verdict(verdict: &Verdict, summary: &RunSummary) {
    for subject in &verdict.subjects {
        let line = format!(
            "{}: {} ({} expected, {} missing, {} duplicated)",
            subject.subject, subject.outcome, subject.expected, subject.missing, subject.duplicates
        );
        match subject.outcome {
            Outcome::Pass => info!("{}", line),
            Outcome::Excused => warn!("{} after session expiry", line),
            Outcome::Fail => error!("{}", line),
        }
        if !subject.members.is_empty() {
            let spread: Vec<String> = subject
                .members
                .iter()
                .map(|m| format!("{}={}", m.subscriber, m.received))
                .collect();
            info!("{} distribution: {}", subject.subject, spread.join(" "));
        }
    }

    for anomaly in &summary.anomalies {
        warn!("Unparseable payload at {}: {:?}", anomaly.subscriber, anomaly.payload);
    }

    let stats = &summary.stats;
    info!(
        "published={} acked={} failed={} received={} repeats={} reconnects={}",
        stats.published, stats.acked, stats.publish_failed, stats.received, stats.repeats, stats.reconnects
    );
    if verdict.passed() {
        info!("Verdict: PASS");
    } else {
        error!(
            "Verdict: FAIL ({} of {} subjects)",
            verdict.failed_subjects().count(),
            verdict.subjects.len()
        );
    }
}
