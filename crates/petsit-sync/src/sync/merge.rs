//! Last-write-wins merge rule

use std::fmt;

use crate::models::{Origin, Record};
use crate::store::StoredRecord;

/// Result of reconciling one incoming record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No record existed; stored
    Inserted,
    /// Replaced an older version
    Updated,
    /// Identical to what is stored; nothing written
    Duplicate,
    /// Lost to the stored version
    Stale,
    /// Stored version is a tombstone and the write may not resurrect it
    BlockedByTombstone,
    /// Malformed input dropped before merging
    Invalid(String),
}

impl Outcome {
    /// Whether the record was written and subscribers notified
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted => f.write_str("inserted"),
            Self::Updated => f.write_str("updated"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::Stale => f.write_str("stale"),
            Self::BlockedByTombstone => f.write_str("blocked_by_tombstone"),
            Self::Invalid(reason) => write!(f, "invalid: {reason}"),
        }
    }
}

/// Decide whether `incoming`, to be stored under `incoming_seq`, replaces `existing`.
pub fn decide(existing: Option<&StoredRecord>, incoming: &Record, incoming_seq: u64) -> Outcome {
    let Some(existing) = existing else {
        return Outcome::Inserted;
    };
    let current = &existing.record;

    if current.same_content(incoming) {
        return Outcome::Duplicate;
    }

    if current.tombstone {
        return if incoming.updated_at > current.updated_at && incoming.resurrect {
            Outcome::Updated
        } else {
            Outcome::BlockedByTombstone
        };
    }

    match incoming.updated_at.cmp(&current.updated_at) {
        std::cmp::Ordering::Greater => Outcome::Updated,
        std::cmp::Ordering::Less => Outcome::Stale,
        std::cmp::Ordering::Equal => match (incoming.origin, current.origin) {
            (Origin::Local, Origin::Remote) => Outcome::Updated,
            (Origin::Remote, Origin::Local) => Outcome::Stale,
            _ => {
                if (incoming.id.as_str(), incoming_seq) > (current.id.as_str(), existing.seq) {
                    Outcome::Updated
                } else {
                    Outcome::Stale
                }
            }
        },
    }
}

/// Per-outcome counts for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub duplicate: usize,
    pub stale: usize,
    pub blocked: usize,
    pub invalid: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Duplicate => self.duplicate += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::BlockedByTombstone => self.blocked += 1,
            Outcome::Invalid(_) => self.invalid += 1,
        }
    }

    pub const fn accepted(&self) -> usize {
        self.inserted + self.updated
    }

    pub const fn total(&self) -> usize {
        self.accepted() + self.duplicate + self.stale + self.blocked + self.invalid
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stored(record: Record, seq: u64) -> StoredRecord {
        StoredRecord { record, seq }
    }

    #[test]
    fn absent_record_is_inserted() {
        let incoming = Record::remote("n-1", "7", json!({"v": "A"}), 100);
        assert_eq!(decide(None, &incoming, 1), Outcome::Inserted);
    }

    #[test]
    fn newer_wins_older_loses() {
        let existing = stored(Record::remote("n-1", "7", json!({"v": "A"}), 100), 1);
        let newer = Record::remote("n-1", "7", json!({"v": "B"}), 101);
        let older = Record::remote("n-1", "7", json!({"v": "B"}), 99);
        assert_eq!(decide(Some(&existing), &newer, 2), Outcome::Updated);
        assert_eq!(decide(Some(&existing), &older, 2), Outcome::Stale);
    }

    #[test]
    fn identical_content_is_duplicate() {
        let record = Record::remote("n-1", "7", json!({"v": "A"}), 100);
        let existing = stored(record.clone(), 1);
        assert_eq!(decide(Some(&existing), &record, 2), Outcome::Duplicate);
    }

    #[test]
    fn equal_timestamp_prefers_local_origin() {
        let remote = stored(Record::remote("n-1", "7", json!({"v": "A"}), 100), 1);
        let local = Record::local("n-1", "7", json!({"v": "B"}), 100);
        assert_eq!(decide(Some(&remote), &local, 2), Outcome::Updated);

        let local_existing = stored(Record::local("n-1", "7", json!({"v": "B"}), 100), 1);
        let remote_incoming = Record::remote("n-1", "7", json!({"v": "A"}), 100);
        assert_eq!(
            decide(Some(&local_existing), &remote_incoming, 2),
            Outcome::Stale
        );
    }

    #[test]
    fn equal_timestamp_same_origin_latest_ingestion_wins() {
        let existing = stored(Record::remote("n-1", "7", json!({"v": "A"}), 100), 4);
        let incoming = Record::remote("n-1", "7", json!({"v": "B"}), 100);
        assert_eq!(decide(Some(&existing), &incoming, 5), Outcome::Updated);
        assert_eq!(decide(Some(&existing), &incoming, 3), Outcome::Stale);
    }

    #[test]
    fn tombstone_is_terminal_without_resurrect() {
        let tombstone = Record::remote("n-1", "7", json!({}), 110).to_tombstone(110, Origin::Remote);
        let existing = stored(tombstone, 1);

        let older = Record::remote("n-1", "7", json!({"v": "A"}), 105);
        let newer = Record::remote("n-1", "7", json!({"v": "A"}), 120);
        let equal = Record::local("n-1", "7", json!({"v": "A"}), 110);
        assert_eq!(decide(Some(&existing), &older, 2), Outcome::BlockedByTombstone);
        assert_eq!(decide(Some(&existing), &newer, 2), Outcome::BlockedByTombstone);
        assert_eq!(decide(Some(&existing), &equal, 2), Outcome::BlockedByTombstone);

        let mut resurrect = newer;
        resurrect.resurrect = true;
        assert_eq!(decide(Some(&existing), &resurrect, 2), Outcome::Updated);

        let mut stale_resurrect = older;
        stale_resurrect.resurrect = true;
        assert_eq!(
            decide(Some(&existing), &stale_resurrect, 2),
            Outcome::BlockedByTombstone
        );
    }

    #[test]
    fn batch_report_counts() {
        let mut report = BatchReport::default();
        for outcome in [
            Outcome::Inserted,
            Outcome::Updated,
            Outcome::Stale,
            Outcome::Invalid("bad".to_string()),
        ] {
            report.record(&outcome);
        }
        assert_eq!(report.accepted(), 2);
        assert_eq!(report.total(), 4);
    }
}
