use super::*;
use crate::fingerprint::{DeliveryKey, Fingerprint};
use pretty_assertions::assert_eq;

fn key(publisher: &str, sequence: u64) -> DeliveryKey {
    DeliveryKey::Fingerprint(Fingerprint::new(publisher, sequence))
}

fn subscriber(id: &str) -> Subject {
    Subject::Subscriber {
        id: id.to_string(),
        expiry_exceeded: false,
    }
}

fn group(name: &str, members: &[&str]) -> Subject {
    Subject::Group {
        name: name.to_string(),
        members: members.iter().map(|m| m.to_string()).collect(),
        expiry_exceeded: false,
    }
}

#[test]
fn test_complete_subscriber_passes() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-0", None);
    for publisher in ["p-0", "p-1"] {
        for seq in 1..=10 {
            ledger.record("s-0", key(publisher, seq));
        }
    }

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0", "p-1"], 10));
    let verdict = engine.evaluate(&[subscriber("s-0")]);

    assert!(verdict.passed());
    assert_eq!(verdict.universe_size, 20);
    assert_eq!(verdict.rows.len(), 20);
    assert_eq!(verdict.count(RowStatus::Pass), 20);
    assert!(verdict.rows.iter().all(|r| r.received_by == "s-0" && r.note.is_empty()));
    assert_eq!(verdict.subjects[0].outcome, Outcome::Pass);
}

#[test]
fn test_repeats_do_not_fail_plain_subscriber() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-0", None);
    for seq in [1, 2, 2, 3, 1] {
        ledger.record("s-0", key("p-0", seq));
    }

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    assert!(engine.evaluate(&[subscriber("s-0")]).passed());
}

#[test]
fn test_gap_fails_with_missing_row() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-0", None);
    ledger.record("s-0", key("p-0", 1));
    ledger.record("s-0", key("p-0", 3));

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    let verdict = engine.evaluate(&[subscriber("s-0")]);

    assert!(!verdict.passed());
    let failed: Vec<_> = verdict
        .rows
        .iter()
        .filter(|r| r.status == RowStatus::Fail)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sequence, 2);
    assert_eq!(failed[0].received_by, "");
    assert_eq!(failed[0].note, "missing");
    assert_eq!(verdict.subjects[0].missing, 1);
}

#[test]
fn test_expired_session_is_excused() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-0", None);
    ledger.record("s-0", key("p-0", 1));

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    let verdict = engine.evaluate(&[Subject::Subscriber {
        id: "s-0".to_string(),
        expiry_exceeded: true,
    }]);

    assert!(verdict.passed());
    assert_eq!(verdict.subjects[0].outcome, Outcome::Excused);
    assert_eq!(verdict.count(RowStatus::Fail), 2);
    assert!(verdict
        .rows
        .iter()
        .filter(|r| r.status == RowStatus::Fail)
        .all(|r| r.note == "missing;session-expired"));
}

#[test]
fn test_group_exactly_once_passes_with_member_counts() {
    let ledger = Arc::new(DeliveryLedger::new());
    let members = ["g-sub-0", "g-sub-1", "g-sub-2"];
    for m in members {
        ledger.register(m, Some("g"));
    }
    for seq in 1..=9 {
        ledger.record(members[(seq as usize - 1) % 3], key("p-0", seq));
    }

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 9));
    let verdict = engine.evaluate(&[group("g", &members)]);

    assert!(verdict.passed());
    assert_eq!(verdict.rows.len(), 9);
    assert_eq!(verdict.rows[0].received_by, "g-sub-0");
    assert_eq!(verdict.rows[4].received_by, "g-sub-1");
    let counts: Vec<u64> = verdict.subjects[0].members.iter().map(|m| m.received).collect();
    assert_eq!(counts, vec![3, 3, 3]);
}

#[test]
fn test_group_duplicate_and_gap_fail() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("a", Some("g"));
    ledger.register("b", Some("g"));
    ledger.record("a", key("p-0", 1));
    ledger.record("b", key("p-0", 1));
    ledger.record("a", key("p-0", 3));

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    let verdict = engine.evaluate(&[group("g", &["a", "b"])]);

    assert!(!verdict.passed());
    let subject = &verdict.subjects[0];
    assert_eq!((subject.missing, subject.duplicates), (1, 1));

    let notes: Vec<(&str, &str, RowStatus)> = verdict
        .rows
        .iter()
        .map(|r| (r.received_by.as_str(), r.note.as_str(), r.status))
        .collect();
    assert_eq!(
        notes,
        vec![
            ("a;b", "duplicate", RowStatus::Fail),
            ("", "missing", RowStatus::Fail),
            ("a", "", RowStatus::Pass),
        ]
    );
}

#[test]
fn test_expired_group_still_fails_on_duplicate() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("g-a", Some("g"));
    ledger.register("g-b", Some("g"));
    ledger.record("g-a", key("p-0", 1));
    ledger.record("g-a", key("p-0", 2));
    ledger.record("g-b", key("p-0", 2));
    ledger.record("g-b", key("p-0", 3));

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    let verdict = engine.evaluate(&[Subject::Group {
        name: "g".to_string(),
        members: vec!["g-a".to_string(), "g-b".to_string()],
        expiry_exceeded: true,
    }]);

    let subject = &verdict.subjects[0];
    assert_eq!((subject.missing, subject.duplicates), (0, 1));
    assert_eq!(subject.outcome, Outcome::Fail);
    assert!(!verdict.passed());
    assert_eq!(verdict.rows[1].note, "duplicate");
}

#[test]
fn test_expired_group_gap_is_excused() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("g-a", Some("g"));
    ledger.register("g-b", Some("g"));
    ledger.record("g-a", key("p-0", 1));
    ledger.record("g-b", key("p-0", 3));

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 3));
    let verdict = engine.evaluate(&[Subject::Group {
        name: "g".to_string(),
        members: vec!["g-a".to_string(), "g-b".to_string()],
        expiry_exceeded: true,
    }]);

    assert_eq!(verdict.subjects[0].outcome, Outcome::Excused);
    assert!(verdict.passed());
    assert_eq!(verdict.rows[1].note, "missing;session-expired");
}

#[test]
fn test_rows_ordered_by_subject_then_fingerprint() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-1", None);
    ledger.register("s-0", None);

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-1", "p-0"], 2));
    let verdict = engine.evaluate(&[subscriber("s-1"), subscriber("s-0")]);

    let order: Vec<String> = verdict
        .rows
        .iter()
        .map(|r| format!("{} {}#{}", r.subject, r.publisher, r.sequence))
        .collect();
    assert_eq!(
        order,
        vec![
            "s-0 p-0#1", "s-0 p-0#2", "s-0 p-1#1", "s-0 p-1#2", "s-1 p-0#1", "s-1 p-0#2",
            "s-1 p-1#1", "s-1 p-1#2",
        ]
    );
    assert_eq!(verdict.failed_subjects().count(), 2);
}

#[test]
fn test_fail_outweighs_excused() {
    let ledger = Arc::new(DeliveryLedger::new());
    ledger.register("s-0", None);
    ledger.register("s-1", None);

    let engine = VerdictEngine::new(ledger, ExpectedUniverse::new(["p-0"], 1));
    let verdict = engine.evaluate(&[
        Subject::Subscriber {
            id: "s-0".to_string(),
            expiry_exceeded: true,
        },
        subscriber("s-1"),
    ]);

    assert!(!verdict.passed());
    assert_eq!(verdict.subjects[0].outcome, Outcome::Excused);
    assert_eq!(verdict.subjects[1].outcome, Outcome::Fail);
}
