//! VibeMQ Verify - inflight delivery verification for MQTT v5.0 brokers
//!
//! Usage:
//!   vibemq-verify [OPTIONS]
//!
//! Exit status:
//!   0  a verdict was produced (PASS, or FAIL without --fail-on-verdict)
//!   1  the harness failed (configuration, connections, barrier timeout, output)
//!   2  the verdict is FAIL and --fail-on-verdict is set

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use humantime_serde::re::humantime::parse_duration;
use tracing::{error, info, Level};

use vibemq_verify::client::{Connector, LoopbackBroker, WireConnector};
use vibemq_verify::config::{Config, FaultModeConfig};
use vibemq_verify::logging;
use vibemq_verify::orchestrator::Orchestrator;
use vibemq_verify::report::CsvReportSink;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FaultMode {
    /// Disconnect every target at once
    Mass,
    /// Disconnect targets one stagger interval apart
    Staggered,
}

/// VibeMQ Verify - MQTT inflight delivery verification
#[derive(Parser, Debug)]
#[command(name = "vibemq-verify")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "Inflight-delivery and shared-subscription verification for MQTT v5.0 brokers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker URL (mqtt://host:port)
    #[arg(short, long)]
    broker: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Run against the in-process loopback broker
    #[arg(long)]
    loopback: bool,

    /// Identity prefix for every client of the run
    #[arg(long)]
    prefix: Option<String>,

    /// Base topic
    #[arg(short, long)]
    topic: Option<String>,

    /// QoS (0, 1, or 2)
    #[arg(short, long)]
    qos: Option<u8>,

    /// Plain subscribers
    #[arg(short, long)]
    subscribers: Option<usize>,

    #[arg(short, long)]
    publishers: Option<usize>,

    /// Messages per publisher
    #[arg(short, long)]
    messages: Option<u64>,

    /// Delay between publishes, e.g. "10ms"
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Session expiry interval in seconds
    #[arg(long)]
    session_expiry: Option<u32>,

    /// Shared-subscription groups (0 = plain subscribers)
    #[arg(long)]
    groups: Option<usize>,

    /// Subscribers per shared group
    #[arg(long)]
    group_size: Option<usize>,

    /// Enable fault injection
    #[arg(long)]
    fault: bool,

    #[arg(long, value_enum)]
    fault_mode: Option<FaultMode>,

    /// Fraction of expected publishes after which faults fire
    #[arg(long)]
    fault_threshold: Option<f64>,

    /// Delay between a fault disconnect and the reconnect, e.g. "3s"
    #[arg(long, value_parser = parse_duration)]
    settle_delay: Option<Duration>,

    /// Reconnect subscribers that lose their connection
    #[arg(long)]
    auto_reconnect: bool,

    /// Clients connected per launch batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Wait after publishing before verifying, e.g. "5s"
    #[arg(long, value_parser = parse_duration)]
    drain: Option<Duration>,

    /// CSV report path
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// JSON summary path
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Prometheus metrics file path
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Exit with status 2 when the verdict is FAIL
    #[arg(long)]
    fail_on_verdict: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Mirror the log stream to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// CLI args override file config
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.broker {
            config.broker.url = url;
        }
        if self.username.is_some() {
            config.broker.username = self.username;
        }
        if self.password.is_some() {
            config.broker.password = self.password;
        }
        config.broker.loopback |= self.loopback;

        let scenario = &mut config.scenario;
        if let Some(prefix) = self.prefix {
            scenario.prefix = prefix;
        }
        if let Some(topic) = self.topic {
            scenario.topic = topic;
        }
        scenario.qos = self.qos.unwrap_or(scenario.qos);
        scenario.subscribers = self.subscribers.unwrap_or(scenario.subscribers);
        scenario.publishers = self.publishers.unwrap_or(scenario.publishers);
        scenario.messages_per_publisher = self.messages.unwrap_or(scenario.messages_per_publisher);
        scenario.publish_interval = self.interval.unwrap_or(scenario.publish_interval);
        scenario.session_expiry = self.session_expiry.unwrap_or(scenario.session_expiry);

        config.shared.groups = self.groups.unwrap_or(config.shared.groups);
        config.shared.group_size = self.group_size.unwrap_or(config.shared.group_size);

        let fault = &mut config.fault;
        fault.enabled |= self.fault;
        fault.auto_reconnect |= self.auto_reconnect;
        if let Some(mode) = self.fault_mode {
            fault.mode = match mode {
                FaultMode::Mass => FaultModeConfig::Mass,
                FaultMode::Staggered => FaultModeConfig::Staggered,
            };
        }
        fault.threshold = self.fault_threshold.unwrap_or(fault.threshold);
        fault.settle_delay = self.settle_delay.unwrap_or(fault.settle_delay);

        config.launch.batch_size = self.batch_size.unwrap_or(config.launch.batch_size);
        config.timeouts.drain = self.drain.unwrap_or(config.timeouts.drain);

        if self.report.is_some() {
            config.output.report = self.report;
        }
        if self.summary.is_some() {
            config.output.summary = self.summary;
        }
        if self.metrics.is_some() {
            config.output.metrics = self.metrics;
        }
        config.output.fail_on_verdict |= self.fail_on_verdict;

        if self.log_file.is_some() {
            config.log.file = self.log_file;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .map(LogLevel::to_tracing_level)
        .or_else(|| logging::parse_level(&config.log.level))
        .unwrap_or(Level::INFO);
    let config_path = args.config.clone();
    args.apply(&mut config);

    if let Err(e) = logging::init(log_level, config.log.file.as_deref()) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::from(1);
    }
    if let Some(path) = config_path {
        info!("Loaded configuration from {:?}", path);
    }

    // File and env layers may be incomplete until the CLI overrides land
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::from(1);
    }

    let connector: Arc<dyn Connector> = if config.broker.loopback {
        Arc::new(LoopbackBroker::new())
    } else {
        match WireConnector::new(&config.broker.url, config.timeouts.connect) {
            Ok(connector) => Arc::new(connector.with_max_packet_size(config.broker.max_packet_size)),
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(1);
            }
        }
    };

    let fail_on_verdict = config.output.fail_on_verdict;
    let sink = Box::new(CsvReportSink::from_output(&config.output));
    let orchestrator = Orchestrator::new(config, connector).with_sink(sink);

    tokio::select! {
        result = orchestrator.run() => match result {
            Ok(outcome) if outcome.verdict.passed() || !fail_on_verdict => ExitCode::SUCCESS,
            Ok(_) => ExitCode::from(2),
            Err(e) => {
                error!("Run failed: {}", e);
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted before a verdict was produced");
            ExitCode::from(1)
        }
    }
}
