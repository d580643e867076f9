//! Delivery Ledger
//!
//! Records which fingerprints each logical subscriber received, keyed by the
//! subscriber identity so that deliveries on any physical connection of that
//! identity land in the same bucket. For shared-subscription groups it also
//! keeps, per fingerprint, every group member that received it.
//!
//! Concurrent writers only contend on a DashMap shard, never on a global lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet;
use compact_str::CompactString;
use dashmap::DashMap;
use smallvec::SmallVec;

use crate::fingerprint::{DeliveryKey, ExpectedUniverse, Fingerprint};

#[cfg(test)]
mod tests;

/// Members of a group that received one fingerprint, in arrival order
pub type Receivers = SmallVec<[CompactString; 2]>;

/// Fingerprint -> receivers for one group, ordered by fingerprint
pub type GroupReceivers = BTreeMap<Fingerprint, Receivers>;

/// What a single `record` call observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First delivery of this fingerprint to the subscriber
    New,
    /// The subscriber already had this fingerprint
    Repeat,
    /// Payload did not parse; kept under its raw text
    Anomaly,
}

#[derive(Debug, Default)]
struct SubscriberBucket {
    group: Option<CompactString>,
    received: AHashSet<Fingerprint>,
    deliveries: u64,
    anomalies: Vec<CompactString>,
}

/// Per-subscriber and per-group record of received fingerprints
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    subscribers: DashMap<CompactString, SubscriberBucket>,
    groups: DashMap<CompactString, GroupReceivers>,
    total: AtomicU64,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a subscriber and the shared group it belongs to, if any
    pub fn register(&self, subscriber: &str, group: Option<&str>) {
        let mut bucket = self.subscribers.entry(subscriber.into()).or_default();
        bucket.group = group.map(CompactString::from);
        if let Some(group) = group {
            self.groups.entry(group.into()).or_default();
        }
    }

    /// Record one delivery. Repeats are kept as a signal, never rejected.
    pub fn record(&self, subscriber: &str, key: DeliveryKey) -> Recorded {
        self.total.fetch_add(1, Ordering::Relaxed);

        let fp = match key {
            DeliveryKey::Fingerprint(fp) => fp,
            DeliveryKey::Raw(raw) => {
                let mut bucket = self.subscribers.entry(subscriber.into()).or_default();
                bucket.deliveries += 1;
                bucket.anomalies.push(raw);
                return Recorded::Anomaly;
            }
        };

        let (outcome, group) = {
            let mut bucket = self.subscribers.entry(subscriber.into()).or_default();
            bucket.deliveries += 1;
            let outcome = if bucket.received.insert(fp.clone()) {
                Recorded::New
            } else {
                Recorded::Repeat
            };
            (outcome, bucket.group.clone())
        };

        if let Some(group) = group {
            self.groups
                .entry(group)
                .or_default()
                .entry(fp)
                .or_default()
                .push(subscriber.into());
        }

        outcome
    }

    /// Expected fingerprints the subscriber never received
    pub fn missing_for(&self, subscriber: &str, universe: &ExpectedUniverse) -> Vec<Fingerprint> {
        match self.subscribers.get(subscriber) {
            Some(bucket) => universe
                .iter()
                .filter(|fp| !bucket.received.contains(fp))
                .collect(),
            None => universe.iter().collect(),
        }
    }

    /// Expected fingerprints no member of the group received
    pub fn missing_for_group(&self, group: &str, universe: &ExpectedUniverse) -> Vec<Fingerprint> {
        match self.groups.get(group) {
            Some(receivers) => universe
                .iter()
                .filter(|fp| !receivers.contains_key(fp))
                .collect(),
            None => universe.iter().collect(),
        }
    }

    /// Snapshot of the group's fingerprint -> receivers map
    pub fn group_receivers(&self, group: &str) -> GroupReceivers {
        self.groups
            .get(group)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Fingerprints whose receiver list does not hold exactly one entry
    pub fn duplicates_in_group(receivers: &GroupReceivers) -> Vec<Fingerprint> {
        receivers
            .iter()
            .filter(|(_, who)| who.len() != 1)
            .map(|(fp, _)| fp.clone())
            .collect()
    }

    /// Deliveries to the subscriber, repeats and anomalies included
    pub fn received_count(&self, subscriber: &str) -> u64 {
        self.subscribers
            .get(subscriber)
            .map_or(0, |b| b.deliveries)
    }

    /// Distinct fingerprints the subscriber holds
    pub fn distinct_count(&self, subscriber: &str) -> usize {
        self.subscribers
            .get(subscriber)
            .map_or(0, |b| b.received.len())
    }

    /// Repeat deliveries of a fingerprint already held
    pub fn repeats_for(&self, subscriber: &str) -> u64 {
        self.subscribers.get(subscriber).map_or(0, |b| {
            b.deliveries - b.received.len() as u64 - b.anomalies.len() as u64
        })
    }

    pub fn anomalies_for(&self, subscriber: &str) -> Vec<CompactString> {
        self.subscribers
            .get(subscriber)
            .map(|b| b.anomalies.clone())
            .unwrap_or_default()
    }

    /// Every delivery recorded across all subscribers
    pub fn total_deliveries(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Known subscriber identities, sorted
    pub fn subscribers(&self) -> Vec<CompactString> {
        let mut ids: Vec<_> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
