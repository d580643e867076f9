//! Ledger tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rand::seq::SliceRandom;

use super::*;

fn fp(publisher: &str, sequence: u64) -> Fingerprint {
    Fingerprint::new(publisher, sequence)
}

fn key(publisher: &str, sequence: u64) -> DeliveryKey {
    DeliveryKey::Fingerprint(fp(publisher, sequence))
}

#[test]
fn test_missing_for_reports_gaps_in_order() {
    let ledger = DeliveryLedger::new();
    let universe = ExpectedUniverse::new(["p-0", "p-1"], 3);
    ledger.register("s-0", None);

    ledger.record("s-0", key("p-0", 1));
    ledger.record("s-0", key("p-0", 3));
    ledger.record("s-0", key("p-1", 2));

    assert_eq!(
        ledger.missing_for("s-0", &universe),
        vec![fp("p-0", 2), fp("p-1", 1), fp("p-1", 3)]
    );
}

#[test]
fn test_unknown_subscriber_misses_everything() {
    let ledger = DeliveryLedger::new();
    let universe = ExpectedUniverse::new(["p-0"], 2);
    assert_eq!(ledger.missing_for("nobody", &universe).len(), 2);
    assert_eq!(ledger.missing_for_group("nobody", &universe).len(), 2);
}

#[test]
fn test_repeat_record_is_idempotent_for_missing_set() {
    let ledger = DeliveryLedger::new();
    let universe = ExpectedUniverse::new(["p-0"], 2);
    ledger.register("s-0", None);

    assert_eq!(ledger.record("s-0", key("p-0", 1)), Recorded::New);
    let before = ledger.missing_for("s-0", &universe);
    assert_eq!(ledger.record("s-0", key("p-0", 1)), Recorded::Repeat);
    assert_eq!(ledger.missing_for("s-0", &universe), before);

    assert_eq!(ledger.received_count("s-0"), 2);
    assert_eq!(ledger.distinct_count("s-0"), 1);
    assert_eq!(ledger.repeats_for("s-0"), 1);
}

#[test]
fn test_anomaly_is_kept_not_dropped() {
    let ledger = DeliveryLedger::new();
    ledger.register("s-0", None);

    assert_eq!(
        ledger.record("s-0", DeliveryKey::from_payload(b"garbage")),
        Recorded::Anomaly
    );
    assert_eq!(ledger.anomalies_for("s-0"), vec![CompactString::from("garbage")]);
    assert_eq!(ledger.received_count("s-0"), 1);
    assert_eq!(ledger.distinct_count("s-0"), 0);
    assert_eq!(ledger.repeats_for("s-0"), 0);
    assert_eq!(ledger.total_deliveries(), 1);
}

#[test]
fn test_group_receivers_and_duplicates() {
    let ledger = DeliveryLedger::new();
    let universe = ExpectedUniverse::new(["p-0"], 3);
    ledger.register("g-a", Some("grp"));
    ledger.register("g-b", Some("grp"));

    ledger.record("g-a", key("p-0", 1));
    ledger.record("g-b", key("p-0", 2));
    ledger.record("g-a", key("p-0", 2));

    let receivers = ledger.group_receivers("grp");
    assert_eq!(receivers.len(), 2);
    assert_eq!(
        receivers[&fp("p-0", 2)].as_slice(),
        &[CompactString::from("g-b"), CompactString::from("g-a")]
    );
    assert_eq!(
        DeliveryLedger::duplicates_in_group(&receivers),
        vec![fp("p-0", 2)]
    );
    assert_eq!(
        ledger.missing_for_group("grp", &universe),
        vec![fp("p-0", 3)]
    );
}

#[test]
fn test_same_member_twice_is_a_group_duplicate() {
    let ledger = DeliveryLedger::new();
    ledger.register("g-a", Some("grp"));
    ledger.record("g-a", key("p-0", 1));
    ledger.record("g-a", key("p-0", 1));

    let receivers = ledger.group_receivers("grp");
    assert_eq!(
        DeliveryLedger::duplicates_in_group(&receivers),
        vec![fp("p-0", 1)]
    );
}

#[test]
fn test_plain_subscribers_do_not_touch_groups() {
    let ledger = DeliveryLedger::new();
    ledger.register("s-0", None);
    ledger.record("s-0", key("p-0", 1));
    assert!(ledger.group_receivers("s-0").is_empty());
    assert_eq!(ledger.received_count("s-0"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_shuffled_arrivals_lose_nothing() {
    let ledger = Arc::new(DeliveryLedger::new());
    let universe = ExpectedUniverse::new(["p-0", "p-1", "p-2"], 200);
    let subscribers = ["s-0", "s-1", "s-2", "s-3"];
    for s in subscribers {
        ledger.register(s, None);
    }

    let mut handles = Vec::new();
    for s in subscribers {
        let mut arrivals: Vec<Fingerprint> = universe.iter().chain(universe.iter()).collect();
        arrivals.shuffle(&mut rand::thread_rng());
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            for fp in arrivals {
                ledger.record(s, DeliveryKey::Fingerprint(fp));
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for s in subscribers {
        assert!(ledger.missing_for(s, &universe).is_empty());
        assert_eq!(ledger.distinct_count(s), universe.len());
        assert_eq!(ledger.received_count(s), 2 * universe.len() as u64);
    }
    assert_eq!(ledger.total_deliveries(), 8 * universe.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_group_members_partition_cleanly() {
    let ledger = Arc::new(DeliveryLedger::new());
    let universe = ExpectedUniverse::new(["p-0"], 300);
    let members = ["m-0", "m-1", "m-2"];
    for m in members {
        ledger.register(m, Some("grp"));
    }

    let mut all: Vec<Fingerprint> = universe.iter().collect();
    all.shuffle(&mut rand::thread_rng());
    let mut handles = Vec::new();
    for (i, m) in members.iter().enumerate() {
        let share: Vec<Fingerprint> = all.iter().skip(i).step_by(members.len()).cloned().collect();
        let ledger = ledger.clone();
        let m = *m;
        handles.push(tokio::spawn(async move {
            for fp in share {
                ledger.record(m, DeliveryKey::Fingerprint(fp));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let receivers = ledger.group_receivers("grp");
    assert!(DeliveryLedger::duplicates_in_group(&receivers).is_empty());
    assert!(ledger.missing_for_group("grp", &universe).is_empty());
    let per_member: u64 = members.iter().map(|m| ledger.received_count(m)).sum();
    assert_eq!(per_member, 300);
}
