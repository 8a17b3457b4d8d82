//! Daily attendance ledger, at most one record per user and day.

use crate::identity::UserDirectory;
use crate::store::{self, Store};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SYSTEM_MARKER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "late" => Ok(AttendanceStatus::Late),
            other => Err(LedgerError::UnknownStatus(other.to_string())),
        }
    }
}

/// Authority behind a mark: a user id, or the automated matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MarkedBy {
    System,
    User(String),
}

impl From<String> for MarkedBy {
    fn from(s: String) -> Self {
        if s == SYSTEM_MARKER {
            MarkedBy::System
        } else {
            MarkedBy::User(s)
        }
    }
}

impl From<MarkedBy> for String {
    fn from(m: MarkedBy) -> Self {
        match m {
            MarkedBy::System => SYSTEM_MARKER.to_string(),
            MarkedBy::User(id) => id,
        }
    }
}

impl fmt::Display for MarkedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkedBy::System => f.write_str(SYSTEM_MARKER),
            MarkedBy::User(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_by: MarkedBy,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a batch write.
#[derive(Debug, Clone)]
pub struct Mark {
    pub user_id: String,
    pub status: AttendanceStatus,
    pub marked_by: MarkedBy,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: Vec<AttendanceRecord>,
    pub rejected: Vec<(String, LedgerError)>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("unknown attendance status {0:?}")]
    UnknownStatus(String),
}

/// Counts for one day over a roster of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub unmarked: usize,
}

pub struct AttendanceLedger {
    records: Vec<AttendanceRecord>,
    index: HashMap<(String, NaiveDate), usize>,
    store: Box<dyn Store<AttendanceRecord>>,
}

impl AttendanceLedger {
    /// Load persisted records. Duplicate (user, date) pairs collapse to the
    /// one with the latest timestamp, in the position of the first.
    pub fn open(store: Box<dyn Store<AttendanceRecord>>) -> Self {
        let loaded = store::load_or_empty(store.as_ref());
        let total = loaded.len();

        let mut records: Vec<AttendanceRecord> = Vec::with_capacity(total);
        let mut index = HashMap::with_capacity(total);
        for record in loaded {
            let key = (record.user_id.clone(), record.date);
            match index.get(&key) {
                Some(&i) => {
                    let existing: &mut AttendanceRecord = &mut records[i];
                    if record.timestamp >= existing.timestamp {
                        *existing = record;
                    }
                }
                None => {
                    index.insert(key, records.len());
                    records.push(record);
                }
            }
        }
        if records.len() != total {
            tracing::warn!(dropped = total - records.len(), "collapsed duplicate attendance records");
        }

        tracing::debug!(count = records.len(), "loaded attendance records");
        Self { records, index, store }
    }

    fn persist(&self) -> bool {
        store::save_logged(self.store.as_ref(), &self.records)
    }

    /// Upsert in memory without persisting.
    fn apply(
        &mut self,
        user_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
        marked_by: MarkedBy,
    ) -> AttendanceRecord {
        let now = Utc::now();
        let key = (user_id.to_string(), date);

        if let Some(&i) = self.index.get(&key) {
            let record = &mut self.records[i];
            if record.status != status {
                tracing::debug!(user_id, date = %date, from = %record.status, to = %status, "status changed");
            }
            record.status = status;
            record.marked_by = marked_by;
            record.timestamp = now;
            return record.clone();
        }

        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            date,
            status,
            marked_by,
            timestamp: now,
        };
        self.index.insert(key, self.records.len());
        self.records.push(record.clone());
        record
    }

    /// Set the status for `user_id` on `date`, overwriting any earlier mark.
    pub fn mark(
        &mut self,
        users: &dyn UserDirectory,
        user_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
        marked_by: MarkedBy,
    ) -> Result<AttendanceRecord, LedgerError> {
        if !users.contains(user_id) {
            return Err(LedgerError::UnknownUser(user_id.to_string()));
        }
        let record = self.apply(user_id, date, status, marked_by);
        self.persist();

        tracing::info!(user_id, date = %date, status = %record.status, marked_by = %record.marked_by, "attendance marked");
        Ok(record)
    }

    /// Apply every valid mark for `date` and persist them in one write.
    ///
    /// Marks for unknown users are rejected individually; the rest still
    /// apply.
    pub fn mark_batch(&mut self, users: &dyn UserDirectory, date: NaiveDate, marks: &[Mark]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for mark in marks {
            if !users.contains(&mark.user_id) {
                outcome
                    .rejected
                    .push((mark.user_id.clone(), LedgerError::UnknownUser(mark.user_id.clone())));
                continue;
            }
            let record = self.apply(&mark.user_id, date, mark.status, mark.marked_by.clone());
            outcome.applied.push(record);
        }

        if !outcome.applied.is_empty() {
            self.persist();
        }
        tracing::info!(
            date = %date,
            applied = outcome.applied.len(),
            rejected = outcome.rejected.len(),
            "attendance batch applied"
        );
        outcome
    }

    /// Records for `date` in insertion order.
    pub fn query(&self, date: NaiveDate) -> Vec<&AttendanceRecord> {
        self.records.iter().filter(|r| r.date == date).collect()
    }

    pub fn status_of(&self, user_id: &str, date: NaiveDate) -> Option<AttendanceStatus> {
        self.index
            .get(&(user_id.to_string(), date))
            .map(|&i| self.records[i].status)
    }

    /// All records for one user, newest day first.
    pub fn history(&self, user_id: &str) -> Vec<&AttendanceRecord> {
        let mut records: Vec<&AttendanceRecord> = self.records.iter().filter(|r| r.user_id == user_id).collect();
        records.sort_by(|a, b| b.date.cmp(&a.date));
        records
    }

    pub fn has_history(&self, user_id: &str) -> bool {
        self.records.iter().any(|r| r.user_id == user_id)
    }

    pub fn summary<'a>(&self, date: NaiveDate, roster: impl IntoIterator<Item = &'a str>) -> DailySummary {
        let mut summary = DailySummary {
            date,
            total: 0,
            present: 0,
            absent: 0,
            late: 0,
            unmarked: 0,
        };
        for user_id in roster {
            summary.total += 1;
            match self.status_of(user_id, date) {
                Some(AttendanceStatus::Present) => summary.present += 1,
                Some(AttendanceStatus::Absent) => summary.absent += 1,
                Some(AttendanceStatus::Late) => summary.late += 1,
                None => summary.unmarked += 1,
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::User;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    struct Roster(HashSet<String>);

    impl Roster {
        fn of(ids: &[&str]) -> Self {
            Roster(ids.iter().map(|s| s.to_string()).collect())
        }
    }

    // Only `contains` matters to the ledger.
    impl UserDirectory for Roster {
        fn user(&self, _id: &str) -> Option<&User> {
            None
        }

        fn contains(&self, id: &str) -> bool {
            self.0.contains(id)
        }
    }

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn teacher() -> MarkedBy {
        MarkedBy::User("2".into())
    }

    fn ledger() -> (AttendanceLedger, MemoryStore<AttendanceRecord>) {
        let backing = MemoryStore::default();
        (AttendanceLedger::open(Box::new(backing.clone())), backing)
    }

    #[test]
    fn test_second_mark_updates_in_place() {
        let users = Roster::of(&["3"]);
        let (mut ledger, backing) = ledger();
        let date = day("2025-01-15");

        let first = ledger.mark(&users, "3", date, AttendanceStatus::Present, teacher()).unwrap();
        let second = ledger.mark(&users, "3", date, AttendanceStatus::Late, teacher()).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.status_of("3", date), Some(AttendanceStatus::Late));
        assert_eq!(ledger.query(date).len(), 1);
        assert_eq!(backing.snapshot().len(), 1);
        assert_eq!(backing.snapshot()[0].status, AttendanceStatus::Late);
    }

    #[test]
    fn test_manual_overrides_system_mark() {
        let users = Roster::of(&["3"]);
        let (mut ledger, _) = ledger();
        let date = day("2025-01-15");

        ledger.mark(&users, "3", date, AttendanceStatus::Present, MarkedBy::System).unwrap();
        let r = ledger.mark(&users, "3", date, AttendanceStatus::Absent, teacher()).unwrap();
        assert_eq!(r.marked_by, teacher());
        assert_eq!(ledger.status_of("3", date), Some(AttendanceStatus::Absent));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let (mut ledger, _) = ledger();
        let err = ledger
            .mark(&Roster::of(&[]), "42", day("2025-01-15"), AttendanceStatus::Present, teacher())
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownUser("42".into()));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_batch_applies_valid_marks_and_persists_once() {
        let users = Roster::of(&["3", "4"]);
        let (mut ledger, backing) = ledger();
        let date = day("2025-01-15");
        let marks: Vec<Mark> = ["3", "99", "4"]
            .iter()
            .map(|id| Mark {
                user_id: id.to_string(),
                status: AttendanceStatus::Present,
                marked_by: MarkedBy::System,
            })
            .collect();

        let outcome = ledger.mark_batch(&users, date, &marks);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.rejected, vec![("99".to_string(), LedgerError::UnknownUser("99".into()))]);
        assert_eq!(backing.snapshot().len(), 2);
    }

    #[test]
    fn test_query_is_per_day_in_insertion_order() {
        let users = Roster::of(&["3", "4", "5"]);
        let (mut ledger, _) = ledger();
        let (d1, d2) = (day("2025-01-15"), day("2025-01-16"));

        ledger.mark(&users, "5", d1, AttendanceStatus::Present, teacher()).unwrap();
        ledger.mark(&users, "3", d1, AttendanceStatus::Absent, teacher()).unwrap();
        ledger.mark(&users, "4", d2, AttendanceStatus::Late, teacher()).unwrap();
        ledger.mark(&users, "5", d1, AttendanceStatus::Late, teacher()).unwrap();

        let ids: Vec<&str> = ledger.query(d1).iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["5", "3"]);
        assert_eq!(ledger.query(d2).len(), 1);
        assert_eq!(ledger.status_of("4", d1), None);
    }

    #[test]
    fn test_history_and_summary() {
        let users = Roster::of(&["3", "4", "5", "6"]);
        let (mut ledger, _) = ledger();
        let (d1, d2) = (day("2025-01-15"), day("2025-01-16"));

        ledger.mark(&users, "3", d1, AttendanceStatus::Present, teacher()).unwrap();
        ledger.mark(&users, "3", d2, AttendanceStatus::Late, teacher()).unwrap();
        ledger.mark(&users, "4", d2, AttendanceStatus::Absent, teacher()).unwrap();
        ledger.mark(&users, "5", d2, AttendanceStatus::Present, teacher()).unwrap();

        let history: Vec<NaiveDate> = ledger.history("3").iter().map(|r| r.date).collect();
        assert_eq!(history, vec![d2, d1]);
        assert!(ledger.has_history("4"));
        assert!(!ledger.has_history("6"));

        let summary = ledger.summary(d2, ["3", "4", "5", "6"]);
        assert_eq!(
            summary,
            DailySummary { date: d2, total: 4, present: 1, absent: 1, late: 1, unmarked: 1 }
        );
    }

    #[test]
    fn test_open_collapses_duplicates_to_latest() {
        let date = day("2025-01-15");
        let at = |s: &str| s.parse::<DateTime<Utc>>().unwrap();
        let rec = |id: &str, status, ts: &str| AttendanceRecord {
            id: id.into(),
            user_id: "3".into(),
            date,
            status,
            marked_by: MarkedBy::System,
            timestamp: at(ts),
        };
        let backing = MemoryStore::with_items(vec![
            rec("a", AttendanceStatus::Late, "2025-01-15T09:30:00Z"),
            rec("b", AttendanceStatus::Present, "2025-01-15T08:00:00Z"),
        ]);

        let ledger = AttendanceLedger::open(Box::new(backing));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.status_of("3", date), Some(AttendanceStatus::Late));
    }

    #[test]
    fn test_record_wire_format() {
        let json = r#"{"id":"r1","userId":"3","date":"2025-01-15","status":"present","markedBy":"system","timestamp":"2025-01-15T08:00:00Z"}"#;
        let record: AttendanceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.marked_by, MarkedBy::System);
        assert_eq!(record.status, AttendanceStatus::Present);

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["markedBy"], "system");
        assert_eq!(back["date"], "2025-01-15");

        let manual: MarkedBy = serde_json::from_str(r#""2""#).unwrap();
        assert_eq!(manual, teacher());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Late".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Late));
        assert!("excused".parse::<AttendanceStatus>().is_err());
    }
}
