//! Configuration Module
//!
//! Provides TOML-based configuration for a verification run:
//! - Broker address and credentials (or the in-process loopback broker)
//! - Scenario shape: topic, QoS, subscriber/publisher counts, session expiry
//! - Shared-subscription groups
//! - Fault injection mode and trigger threshold
//! - Launch batching, timeouts and the drain window
//! - Report, summary and metrics output
//! - Environment variable overrides (VIBEMQ_VERIFY__ prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::fingerprint::validate_publisher_id;
use crate::protocol::QoS;
use crate::topic::{validate_group_name, validate_topic_name};

/// Expand `${VAR}` and `${VAR:-default}` references in raw TOML text.
/// Unset variables without a default expand to nothing.
fn substitute_env_vars(content: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    let expanded = pattern.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1])
            .ok()
            .or_else(|| caps.get(2).map(|m| m.as_str().to_owned()))
            .unwrap_or_default()
    });
    expanded.into_owned()
}


/// Why a run configuration could not be produced
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// Layering or deserialization failure in the `config` builder
    Config(config::ConfigError),
    /// Values that parse but cannot describe a runnable scenario
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "reading config file: {}", e),
            ConfigError::Parse(e) => write!(f, "parsing config: {}", e),
            ConfigError::Config(e) => write!(f, "building config: {}", e),
            ConfigError::Validation(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Everything one verification run needs
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub broker: BrokerConfig,
    pub scenario: ScenarioConfig,
    pub shared: SharedConfig,
    pub fault: FaultConfig,
    pub launch: LaunchConfig,
    pub timeouts: TimeoutsConfig,
    pub output: OutputConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Mirror the log stream to this file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Broker under test
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://host:port`, `tcp://host:port`, `host:port` or `host`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Run against the in-process loopback broker instead of `url`
    pub loopback: bool,
    /// Keep alive in seconds
    pub keep_alive: u16,
    /// Maximum inbound packet size in bytes
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            loopback: false,
            keep_alive: 60,
            max_packet_size: 1024 * 1024,
        }
    }
}

/// Shape of the run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Prefix for every client identity of this run
    pub prefix: String,
    /// Base topic; shared groups subscribe to `$share/<group>/<topic>`
    pub topic: String,
    /// QoS for subscriptions and publishes (0, 1 or 2)
    pub qos: u8,
    /// Plain subscribers (ignored when shared groups are configured)
    pub subscribers: usize,
    pub publishers: usize,
    pub messages_per_publisher: u64,
    /// Session expiry interval in seconds
    pub session_expiry: u32,
    /// Delay between successive publishes of one publisher
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,
    /// Message expiry interval in seconds
    pub message_expiry: Option<u32>,
    /// Embed the send time in payloads for latency measurement
    pub timestamps: bool,
    /// Publishes awaiting acknowledgment per publisher
    pub max_inflight: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            prefix: "verify".to_string(),
            topic: "verify/inflight".to_string(),
            qos: 1,
            subscribers: 1,
            publishers: 1,
            messages_per_publisher: 100,
            session_expiry: 300,
            publish_interval: Duration::from_millis(10),
            message_expiry: None,
            timestamps: true,
            max_inflight: 100,
        }
    }
}

/// Shared-subscription groups
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// Number of groups; 0 runs plain subscribers
    pub groups: usize,
    /// Subscribers per group
    pub group_size: usize,
    pub group_prefix: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            groups: 0,
            group_size: 3,
            group_prefix: "group".to_string(),
        }
    }
}

/// How subscribers are disconnected during fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultModeConfig {
    /// Every target at once
    #[default]
    Mass,
    /// Target `i` acts after `i * stagger`
    Staggered,
}

/// Fault injection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub enabled: bool,
    pub mode: FaultModeConfig,
    /// Fraction of all expected publishes after which the fault fires
    pub threshold: f64,
    /// Time between a target's disconnect and its reconnect
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Offset between targets in staggered mode
    #[serde(with = "humantime_serde")]
    pub stagger: Duration,
    /// Reconnect subscribers that lose their connection unexpectedly
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff_max: Duration,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: FaultModeConfig::Mass,
            threshold: 1.0 / 3.0,
            settle_delay: Duration::from_secs(3),
            stagger: Duration::from_millis(500),
            auto_reconnect: false,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(10),
        }
    }
}

/// Connection batching
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Clients started concurrently per batch
    pub batch_size: usize,
    /// Pause between batches
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Bounded waits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    #[serde(with = "humantime_serde")]
    pub subscribe: Duration,
    /// Per-publish acknowledgment wait
    #[serde(with = "humantime_serde")]
    pub ack: Duration,
    /// Barrier: every subscriber active
    #[serde(with = "humantime_serde")]
    pub subscriber_ready: Duration,
    /// Barrier: every publisher connected
    #[serde(with = "humantime_serde")]
    pub publisher_ready: Duration,
    /// Upper bound on the whole publish phase
    #[serde(with = "humantime_serde")]
    pub publish_phase: Duration,
    /// Wait after the last publish before reading the ledger
    #[serde(with = "humantime_serde")]
    pub drain: Duration,
    /// Throughput log interval
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            subscribe: Duration::from_secs(10),
            ack: Duration::from_secs(10),
            subscriber_ready: Duration::from_secs(60),
            publisher_ready: Duration::from_secs(30),
            publish_phase: Duration::from_secs(600),
            drain: Duration::from_secs(5),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Report output
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// CSV verdict rows
    pub report: Option<PathBuf>,
    /// JSON run summary
    pub summary: Option<PathBuf>,
    /// Prometheus text exposition of the final counters
    pub metrics: Option<PathBuf>,
    /// Exit with status 2 when the verdict is FAIL
    pub fail_on_verdict: bool,
}

impl Config {
    /// Layer built-in defaults, the TOML file (after `${VAR:-default}`
    /// expansion) and `VIBEMQ_VERIFY__SECTION__KEY` environment variables.
    /// A missing file is not an error. The result is not validated: command
    /// line overrides may still complete it, so call [`Config::validate`]
    /// once they are applied.
    ///
    /// `VIBEMQ_VERIFY__SCENARIO__SUBSCRIBERS=500` sets `scenario.subscribers`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.url", "mqtt://localhost:1883")?
            .set_default("broker.loopback", false)?
            .set_default("broker.keep_alive", 60)?
            .set_default("broker.max_packet_size", 1024 * 1024)?
            .set_default("scenario.prefix", "verify")?
            .set_default("scenario.topic", "verify/inflight")?
            .set_default("scenario.qos", 1)?
            .set_default("scenario.subscribers", 1)?
            .set_default("scenario.publishers", 1)?
            .set_default("scenario.messages_per_publisher", 100)?
            .set_default("scenario.session_expiry", 300)?
            .set_default("scenario.publish_interval", "10ms")?
            .set_default("scenario.timestamps", true)?
            .set_default("scenario.max_inflight", 100)?
            .set_default("shared.groups", 0)?
            .set_default("shared.group_size", 3)?
            .set_default("shared.group_prefix", "group")?
            .set_default("fault.enabled", false)?
            .set_default("fault.mode", "mass")?
            .set_default("fault.threshold", 1.0 / 3.0)?
            .set_default("fault.settle_delay", "3s")?
            .set_default("fault.stagger", "500ms")?
            .set_default("fault.auto_reconnect", false)?
            .set_default("fault.reconnect_attempts", 5)?
            .set_default("fault.reconnect_backoff", "500ms")?
            .set_default("fault.reconnect_backoff_max", "10s")?
            .set_default("launch.batch_size", 50)?
            .set_default("launch.batch_delay", "100ms")?
            .set_default("timeouts.connect", "10s")?
            .set_default("timeouts.subscribe", "10s")?
            .set_default("timeouts.ack", "10s")?
            .set_default("timeouts.subscriber_ready", "60s")?
            .set_default("timeouts.publisher_ready", "30s")?
            .set_default("timeouts.publish_phase", "10m")?
            .set_default("timeouts.drain", "5s")?
            .set_default("timeouts.stats_interval", "5s")?
            .set_default("output.fail_on_verdict", false)?;

        match std::fs::read_to_string(path.as_ref()) {
            Ok(raw) => {
                let toml = substitute_env_vars(&raw);
                builder = builder.add_source(File::from_str(&toml, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // "__" nests; single underscores stay part of the key
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ_VERIFY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize::<Config>()?)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse TOML text directly; no defaults layer and no environment
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config = toml::from_str::<Config>(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Every failure here is reported before any
    /// connection is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scenario = &self.scenario;

        if self.qos().is_none() {
            return Err(ConfigError::Validation(
                "scenario.qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.shared.groups == 0 && scenario.subscribers < 1 {
            return Err(ConfigError::Validation(
                "scenario.subscribers must be at least 1".to_string(),
            ));
        }
        if scenario.publishers < 1 {
            return Err(ConfigError::Validation(
                "scenario.publishers must be at least 1".to_string(),
            ));
        }
        if scenario.messages_per_publisher < 1 {
            return Err(ConfigError::Validation(
                "scenario.messages_per_publisher must be at least 1".to_string(),
            ));
        }
        validate_topic_name(&scenario.topic)
            .map_err(|e| ConfigError::Validation(format!("scenario.topic: {}", e)))?;
        validate_publisher_id(&format!("{}-pub-0", scenario.prefix))
            .map_err(|e| ConfigError::Validation(format!("scenario.prefix: {}", e)))?;
        if scenario.max_inflight < 1 {
            return Err(ConfigError::Validation(
                "scenario.max_inflight must be at least 1".to_string(),
            ));
        }

        if self.shared.groups > 0 {
            if self.shared.group_size < 1 {
                return Err(ConfigError::Validation(
                    "shared.group_size must be at least 1".to_string(),
                ));
            }
            validate_group_name(&format!("{}-0", self.shared.group_prefix))
                .map_err(|e| ConfigError::Validation(format!("shared.group_prefix: {}", e)))?;
        }

        if !(self.fault.threshold > 0.0 && self.fault.threshold <= 1.0) {
            return Err(ConfigError::Validation(
                "fault.threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.launch.batch_size < 1 {
            return Err(ConfigError::Validation(
                "launch.batch_size must be at least 1".to_string(),
            ));
        }

        if !self.broker.loopback {
            crate::client::wire::parse_broker_url(&self.broker.url)
                .map_err(|e| ConfigError::Validation(format!("broker.url: {}", e)))?;
        }

        Ok(())
    }

    pub fn qos(&self) -> Option<QoS> {
        QoS::from_u8(self.scenario.qos)
    }

    /// Subscriber identities the run creates
    pub fn subscriber_count(&self) -> usize {
        if self.shared.groups > 0 {
            self.shared.groups * self.shared.group_size
        } else {
            self.scenario.subscribers
        }
    }
}
