//! VibeMQ Verify - inflight delivery verification for MQTT v5.0 brokers
//!
//! Drives many persistent-session subscribers and fingerprinting publishers
//! against a broker, optionally disconnects and reconnects subscribers while
//! messages are in flight, and checks that every published message reached
//! every subscriber (or exactly one member of each shared-subscription
//! group).

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod fingerprint;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod publisher;
pub mod report;
pub mod session;
pub mod stats;
pub mod topic;
pub mod verdict;

pub use client::{Connection, Connector, LoopbackBroker, WireConnector};
pub use config::Config;
pub use fingerprint::{DeliveryKey, ExpectedUniverse, Fingerprint};
pub use ledger::DeliveryLedger;
pub use orchestrator::{Orchestrator, Phase, RunError, RunOutcome};
pub use protocol::QoS;
pub use report::{CsvReportSink, MemorySink, ReportSink};
pub use verdict::{Verdict, VerdictEngine};
