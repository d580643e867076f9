//! Message fingerprints
//!
//! Every published payload is `<publisher>#<sequence>`, optionally followed
//! by `@<send-time-micros>` for latency measurement. The fingerprint is the
//! ledger key; payloads that do not parse are kept under their raw text.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Origin of one published message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub publisher: CompactString,
    pub sequence: u64,
}

impl Fingerprint {
    pub fn new(publisher: impl Into<CompactString>, sequence: u64) -> Self {
        Self {
            publisher: publisher.into(),
            sequence,
        }
    }

    /// Payload bytes carrying this fingerprint
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// Payload bytes carrying this fingerprint and a send timestamp
    pub fn to_timed_payload(&self, sent_micros: u64) -> Bytes {
        Bytes::from(format!("{}@{}", self, sent_micros))
    }

    /// Parse a payload; returns the fingerprint and the send timestamp if present
    pub fn parse(payload: &[u8]) -> Option<(Self, Option<u64>)> {
        let text = std::str::from_utf8(payload).ok()?;
        let (publisher, rest) = text.rsplit_once('#')?;
        if validate_publisher_id(publisher).is_err() {
            return None;
        }

        let (sequence, sent) = match rest.split_once('@') {
            Some((seq, micros)) => (seq, Some(micros.parse::<u64>().ok()?)),
            None => (rest, None),
        };
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let sequence = sequence.parse::<u64>().ok().filter(|&s| s >= 1)?;

        Some((Self::new(publisher, sequence), sent))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.publisher, self.sequence)
    }
}

/// Publisher identities may not contain the payload separators
pub fn validate_publisher_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("publisher id cannot be empty");
    }
    if id.contains(['#', '@', '/']) || id.chars().any(char::is_whitespace) {
        return Err("publisher id cannot contain '#', '@', '/' or whitespace");
    }
    Ok(())
}

/// What the ledger records for one inbound payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeliveryKey {
    Fingerprint(Fingerprint),
    /// Payload that does not follow the fingerprint convention
    Raw(CompactString),
}

impl DeliveryKey {
    pub fn from_payload(payload: &[u8]) -> Self {
        match Fingerprint::parse(payload) {
            Some((fp, _)) => DeliveryKey::Fingerprint(fp),
            None => DeliveryKey::Raw(CompactString::from(String::from_utf8_lossy(payload))),
        }
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            DeliveryKey::Fingerprint(fp) => Some(fp),
            DeliveryKey::Raw(_) => None,
        }
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryKey::Fingerprint(fp) => fp.fmt(f),
            DeliveryKey::Raw(raw) => write!(f, "raw:{}", raw),
        }
    }
}

/// Every fingerprint the run is expected to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedUniverse {
    publishers: Vec<CompactString>,
    messages_per_publisher: u64,
}

impl ExpectedUniverse {
    pub fn new<I, S>(publishers: I, messages_per_publisher: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        let mut publishers: Vec<CompactString> = publishers.into_iter().map(Into::into).collect();
        publishers.sort();
        publishers.dedup();
        Self {
            publishers,
            messages_per_publisher,
        }
    }

    pub fn publishers(&self) -> &[CompactString] {
        &self.publishers
    }

    pub fn messages_per_publisher(&self) -> u64 {
        self.messages_per_publisher
    }

    pub fn len(&self) -> usize {
        self.publishers.len() * self.messages_per_publisher as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        fp.sequence >= 1
            && fp.sequence <= self.messages_per_publisher
            && self.publishers.binary_search(&fp.publisher).is_ok()
    }

    /// Fingerprints ordered by publisher, then sequence
    pub fn iter(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.publishers.iter().flat_map(move |publisher| {
            (1..=self.messages_per_publisher).map(move |seq| Fingerprint::new(publisher.clone(), seq))
        })
    }
}

/// Wall-clock microseconds since the Unix epoch
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_payload_format() {
        let fp = Fingerprint::new("run-pub-0", 7);
        assert_eq!(&fp.to_payload()[..], b"run-pub-0#7");
        assert_eq!(&fp.to_timed_payload(42)[..], b"run-pub-0#7@42");
    }

    #[test]
    fn test_parse_timed_payload() {
        let (fp, sent) = Fingerprint::parse(b"run-pub-1#12@1700000000000000").unwrap();
        assert_eq!(fp, Fingerprint::new("run-pub-1", 12));
        assert_eq!(sent, Some(1_700_000_000_000_000));
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"no-separator" ; "missing hash")]
    #[test_case(b"#5" ; "empty publisher")]
    #[test_case(b"pub#0" ; "sequence zero")]
    #[test_case(b"pub#" ; "empty sequence")]
    #[test_case(b"pub#+5" ; "signed sequence")]
    #[test_case(b"pub#x1" ; "non numeric")]
    #[test_case(b"pub#3@soon" ; "bad timestamp")]
    #[test_case(b"a b#3" ; "whitespace in publisher")]
    #[test_case(&[0xff, 0xfe, b'#', b'1'] ; "invalid utf8")]
    fn test_unparseable_payload_falls_back_to_raw(payload: &[u8]) {
        assert!(Fingerprint::parse(payload).is_none());
        assert!(matches!(
            DeliveryKey::from_payload(payload),
            DeliveryKey::Raw(_)
        ));
    }

    #[test]
    fn test_raw_key_keeps_lossy_text() {
        assert_eq!(
            DeliveryKey::from_payload(b"hello"),
            DeliveryKey::Raw(CompactString::from("hello"))
        );
        assert_eq!(DeliveryKey::from_payload(b"hello").to_string(), "raw:hello");
    }

    #[test]
    fn test_validate_publisher_id() {
        assert!(validate_publisher_id("verify-pub-0").is_ok());
        assert!(validate_publisher_id("").is_err());
        assert!(validate_publisher_id("a#b").is_err());
        assert!(validate_publisher_id("a@b").is_err());
        assert!(validate_publisher_id("a/b").is_err());
        assert!(validate_publisher_id("a\tb").is_err());
    }

    #[test]
    fn test_universe_iteration_order_and_membership() {
        let universe = ExpectedUniverse::new(["p-1", "p-0"], 2);
        assert_eq!(universe.len(), 4);
        let all: Vec<String> = universe.iter().map(|fp| fp.to_string()).collect();
        assert_eq!(all, vec!["p-0#1", "p-0#2", "p-1#1", "p-1#2"]);

        assert!(universe.contains(&Fingerprint::new("p-1", 2)));
        assert!(!universe.contains(&Fingerprint::new("p-1", 3)));
        assert!(!universe.contains(&Fingerprint::new("p-2", 1)));
        assert!(!universe.contains(&Fingerprint::new("p-0", 0)));
    }

    proptest! {
        #[test]
        fn prop_fingerprint_roundtrip(publisher in "[A-Za-z0-9_.:-]{1,24}", sequence in 1u64..u64::MAX) {
            let fp = Fingerprint::new(publisher.as_str(), sequence);
            let (parsed, sent) = Fingerprint::parse(&fp.to_payload()).unwrap();
            prop_assert_eq!(parsed, fp.clone());
            prop_assert_eq!(sent, None);

            let (parsed, sent) = Fingerprint::parse(&fp.to_timed_payload(sequence)).unwrap();
            prop_assert_eq!(parsed, fp);
            prop_assert_eq!(sent, Some(sequence));
        }
    }
}
