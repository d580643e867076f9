//! Verdict Engine
//!
//! Turns the ledger into per-fingerprint report rows and a pass/fail outcome
//! per subject.
//!
//! - Plain subscriber: passes when it received every expected fingerprint.
//! - Shared group: passes when every expected fingerprint reached exactly one
//!   member. Missing (no member) and duplicated (several members, or one
//!   member twice) both fail.
//!
//! A subject whose reconnect came after its session-expiry window keeps its
//! missing rows, tagged `session-expired`, and is `Excused` rather than
//! failed when gaps are its only fault: the broker was allowed to drop that
//! session. Duplicates still fail.

use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use compact_str::CompactString;
use serde::Serialize;

use crate::fingerprint::{ExpectedUniverse, Fingerprint};
use crate::ledger::{DeliveryLedger, GroupReceivers};

#[cfg(test)]
mod tests;

/// Note attached to rows of a subject whose session expired
pub const NOTE_SESSION_EXPIRED: &str = "session-expired";

/// What a verdict is computed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Subscriber {
        id: String,
        expiry_exceeded: bool,
    },
    Group {
        name: String,
        members: Vec<String>,
        expiry_exceeded: bool,
    },
}

impl Subject {
    pub fn name(&self) -> &str {
        match self {
            Subject::Subscriber { id, .. } => id,
            Subject::Group { name, .. } => name,
        }
    }

    fn expiry_exceeded(&self) -> bool {
        match self {
            Subject::Subscriber {
                expiry_exceeded, ..
            }
            | Subject::Group {
                expiry_exceeded, ..
            } => *expiry_exceeded,
        }
    }
}

/// Per-fingerprint status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowStatus {
    Pass,
    Fail,
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowStatus::Pass => f.write_str("Pass"),
            RowStatus::Fail => f.write_str("Fail"),
        }
    }
}

/// One report line: subject x publisher x sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerdictRow {
    pub subject: String,
    pub publisher: CompactString,
    pub sequence: u64,
    /// Receivers, `;`-separated; empty when nobody received it
    pub received_by: String,
    pub status: RowStatus,
    pub note: String,
}

/// Outcome for one subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    /// Gaps after an expired session; not counted against the broker
    Excused,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => f.write_str("PASS"),
            Outcome::Fail => f.write_str("FAIL"),
            Outcome::Excused => f.write_str("EXCUSED"),
        }
    }
}

/// Received-message count of one group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberCount {
    pub subscriber: String,
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectVerdict {
    pub subject: String,
    pub outcome: Outcome,
    pub expected: usize,
    pub missing: usize,
    pub duplicates: usize,
    /// Load distribution across group members; empty for plain subscribers
    pub members: Vec<MemberCount>,
}

/// The full result of one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub universe_size: usize,
    pub subjects: Vec<SubjectVerdict>,
    #[serde(skip)]
    pub rows: Vec<VerdictRow>,
}

impl Verdict {
    /// True unless some subject failed. Excused subjects do not fail the run.
    pub fn passed(&self) -> bool {
        self.subjects.iter().all(|s| s.outcome != Outcome::Fail)
    }

    pub fn failed_subjects(&self) -> impl Iterator<Item = &SubjectVerdict> {
        self.subjects.iter().filter(|s| s.outcome == Outcome::Fail)
    }

    pub fn count(&self, status: RowStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }
}

pub struct VerdictEngine {
    ledger: Arc<DeliveryLedger>,
    universe: ExpectedUniverse,
}

impl VerdictEngine {
    pub fn new(ledger: Arc<DeliveryLedger>, universe: ExpectedUniverse) -> Self {
        Self { ledger, universe }
    }

    /// Evaluate every subject. Rows come out ordered by subject, then
    /// publisher, then sequence.
    pub fn evaluate(&self, subjects: &[Subject]) -> Verdict {
        let mut ordered: Vec<&Subject> = subjects.iter().collect();
        ordered.sort_by(|a, b| a.name().cmp(b.name()));

        let mut verdict = Verdict {
            universe_size: self.universe.len(),
            ..Default::default()
        };

        for subject in ordered {
            let subject_verdict = match subject {
                Subject::Subscriber { id, .. } => self.subscriber(subject, id, &mut verdict.rows),
                Subject::Group { name, members, .. } => {
                    self.group(subject, name, members, &mut verdict.rows)
                }
            };
            verdict.subjects.push(subject_verdict);
        }
        verdict
    }

    fn subscriber(&self, subject: &Subject, id: &str, rows: &mut Vec<VerdictRow>) -> SubjectVerdict {
        let expired = subject.expiry_exceeded();
        let missing: AHashSet<Fingerprint> =
            self.ledger.missing_for(id, &self.universe).into_iter().collect();

        for fp in self.universe.iter() {
            let received = !missing.contains(&fp);
            rows.push(VerdictRow {
                subject: id.to_string(),
                publisher: fp.publisher,
                sequence: fp.sequence,
                received_by: if received { id.to_string() } else { String::new() },
                status: if received { RowStatus::Pass } else { RowStatus::Fail },
                note: fail_note(received, "missing", expired),
            });
        }

        SubjectVerdict {
            subject: id.to_string(),
            outcome: outcome(missing.is_empty(), expired),
            expected: self.universe.len(),
            missing: missing.len(),
            duplicates: 0,
            members: Vec::new(),
        }
    }

    fn group(
        &self,
        subject: &Subject,
        name: &str,
        members: &[String],
        rows: &mut Vec<VerdictRow>,
    ) -> SubjectVerdict {
        let expired = subject.expiry_exceeded();
        let receivers: GroupReceivers = self.ledger.group_receivers(name);
        let missing = self.ledger.missing_for_group(name, &self.universe).len();
        let duplicates = DeliveryLedger::duplicates_in_group(&receivers)
            .iter()
            .filter(|fp| self.universe.contains(fp))
            .count();

        for fp in self.universe.iter() {
            let got: Vec<&str> = receivers
                .get(&fp)
                .map(|r| r.iter().map(|s| s.as_str()).collect())
                .unwrap_or_default();
            let (status, reason) = match got.len() {
                1 => (RowStatus::Pass, ""),
                0 => (RowStatus::Fail, "missing"),
                _ => (RowStatus::Fail, "duplicate"),
            };
            rows.push(VerdictRow {
                subject: name.to_string(),
                publisher: fp.publisher,
                sequence: fp.sequence,
                received_by: got.join(";"),
                status,
                note: fail_note(status == RowStatus::Pass, reason, expired && got.is_empty()),
            });
        }

        let mut member_counts: Vec<MemberCount> = members
            .iter()
            .map(|m| MemberCount {
                subscriber: m.clone(),
                received: self.ledger.received_count(m),
            })
            .collect();
        member_counts.sort_by(|a, b| a.subscriber.cmp(&b.subscriber));

        SubjectVerdict {
            subject: name.to_string(),
            outcome: if duplicates > 0 {
                Outcome::Fail
            } else {
                outcome(missing == 0, expired)
            },
            expected: self.universe.len(),
            missing,
            duplicates,
            members: member_counts,
        }
    }
}

/// An expired session only excuses gaps; callers decide duplicates first
fn outcome(clean: bool, expired: bool) -> Outcome {
    match (clean, expired) {
        (true, _) => Outcome::Pass,
        (false, true) => Outcome::Excused,
        (false, false) => Outcome::Fail,
    }
}

fn fail_note(passed: bool, reason: &str, expired: bool) -> String {
    match (passed, expired) {
        (true, _) => String::new(),
        (false, true) => format!("{};{}", reason, NOTE_SESSION_EXPIRED),
        (false, false) => reason.to_string(),
    }
}
