//! Safety journal.
//!
//! Append-only SQLite log of everything the safety core decided and did:
//! verdicts, hysteresis state, emergency stages, command outcomes, bus
//! events and session boundaries. On restart [`Journal::recover`] returns the
//! last verdict, hysteresis state and stage so latches and recovery holds
//! survive a crash.
//!
//! # Storage layout
//!
//! | column      | type    | description                               |
//! |-------------|---------|-------------------------------------------|
//! | seq         | INTEGER | Monotonic primary key                     |
//! | recorded_at | TEXT    | RFC-3339 time of the entry (UTC)          |
//! | kind        | TEXT    | [`JournalKind`] tag                       |
//! | payload     | TEXT    | JSON body                                 |
//!
//! # Example
//!
//! ```rust
//! use vigil_memory::journal::{Journal, JournalKind};
//! use vigil_types::EmergencyStage;
//!
//! let journal = Journal::open_in_memory().unwrap();
//! journal.append(JournalKind::Stage, &EmergencyStage::Park).unwrap();
//!
//! let recovered = journal.recover().unwrap();
//! assert_eq!(recovered.stage, EmergencyStage::Park);
//! assert!(recovered.verdict.is_none());
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use vigil_types::{EmergencyStage, HysteresisState, SafetyVerdict, VigilError};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Bad timestamp in journal: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("Unknown journal kind '{0}'")]
    UnknownKind(String),
}

impl From<JournalError> for VigilError {
    fn from(e: JournalError) -> Self {
        VigilError::Journal(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalKind {
    Verdict,
    Hysteresis,
    Stage,
    Command,
    /// Archived bus events.
    Observation,
    Session,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Verdict => "verdict",
            JournalKind::Hysteresis => "hysteresis",
            JournalKind::Stage => "stage",
            JournalKind::Command => "command",
            JournalKind::Observation => "observation",
            JournalKind::Session => "session",
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalKind {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verdict" => Ok(JournalKind::Verdict),
            "hysteresis" => Ok(JournalKind::Hysteresis),
            "stage" => Ok(JournalKind::Stage),
            "command" => Ok(JournalKind::Command),
            "observation" => Ok(JournalKind::Observation),
            "session" => Ok(JournalKind::Session),
            other => Err(JournalError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub kind: JournalKind,
    pub payload: serde_json::Value,
}

/// State restored from the journal at start-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveredState {
    pub verdict: Option<SafetyVerdict>,
    pub hysteresis: HysteresisState,
    pub stage: EmergencyStage,
}

// ─────────────────────────────────────────────────────────────────────────────
// Journal
// ─────────────────────────────────────────────────────────────────────────────

pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open (or create) the journal database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Open a temporary in-memory journal (useful for testing).
    pub fn open_in_memory() -> Result<Self, JournalError> {
        let conn = Connection::open_in_memory()?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<(), JournalError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS journal (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS journal_kind ON journal (kind, seq);
            CREATE INDEX IF NOT EXISTS journal_time ON journal (recorded_at);",
        )?;
        Ok(())
    }

    /// Append `payload` stamped with the current time. Returns its sequence number.
    pub fn append<T: Serialize>(&self, kind: JournalKind, payload: &T) -> Result<i64, JournalError> {
        self.append_at(kind, Utc::now(), payload)
    }

    pub fn append_at<T: Serialize>(
        &self,
        kind: JournalKind,
        recorded_at: DateTime<Utc>,
        payload: &T,
    ) -> Result<i64, JournalError> {
        let body = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO journal (recorded_at, kind, payload) VALUES (?1, ?2, ?3)",
            params![timestamp(recorded_at), kind.as_str(), body],
        )?;
        let seq = self.conn.last_insert_rowid();
        debug!(seq, %kind, "journal entry appended");
        Ok(seq)
    }

    /// The most recent payload of `kind`, decoded as `T`.
    pub fn latest<T: DeserializeOwned>(&self, kind: JournalKind) -> Result<Option<T>, JournalError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM journal WHERE kind = ?1 ORDER BY seq DESC LIMIT 1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Every entry recorded at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, recorded_at, kind, payload FROM journal
             WHERE recorded_at >= ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![timestamp(since)], |row| {
            let seq: i64 = row.get(0)?;
            let recorded_at: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let payload: String = row.get(3)?;
            Ok((seq, recorded_at, kind, payload))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, recorded_at, kind, payload) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)?.with_timezone(&Utc);
            entries.push(JournalEntry {
                seq,
                recorded_at,
                kind: kind.parse()?,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<u64, JournalError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool, JournalError> {
        Ok(self.len()? == 0)
    }

    /// Last verdict, hysteresis state and stage. Anything never written
    /// comes back as its default.
    pub fn recover(&self) -> Result<RecoveredState, JournalError> {
        Ok(RecoveredState {
            verdict: self.latest(JournalKind::Verdict)?,
            hysteresis: self.latest(JournalKind::Hysteresis)?.unwrap_or_default(),
            stage: self.latest(JournalKind::Stage)?.unwrap_or_default(),
        })
    }
}

/// Fixed-width UTC timestamps, so `recorded_at` orders correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vigil_types::{Latch, Trigger, VerdictLevel, VerdictReason};

    fn park_verdict(at: DateTime<Utc>) -> SafetyVerdict {
        SafetyVerdict::from_reasons(
            vec![VerdictReason {
                trigger: Trigger::WindPark,
                metric: None,
                level: VerdictLevel::ParkRequired,
                message: "wind 27.0mph is above the 25mph limit".into(),
                measured: 27.0,
                threshold: 25.0,
            }],
            at,
        )
    }

    #[test]
    fn empty_journal_recovers_defaults() {
        let journal = Journal::open_in_memory().unwrap();
        let recovered = journal.recover().unwrap();
        assert_eq!(recovered, RecoveredState::default());
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn latest_returns_most_recent_of_kind() {
        let journal = Journal::open_in_memory().unwrap();
        journal.append(JournalKind::Stage, &EmergencyStage::Park).unwrap();
        journal.append(JournalKind::Session, &"20260301_030000").unwrap();
        journal.append(JournalKind::Stage, &EmergencyStage::Close).unwrap();

        let stage: Option<EmergencyStage> = journal.latest(JournalKind::Stage).unwrap();
        assert_eq!(stage, Some(EmergencyStage::Close));
    }

    #[test]
    fn recover_restores_latches() {
        let journal = Journal::open_in_memory().unwrap();
        let now = Utc::now();
        let mut hysteresis = HysteresisState::default();
        hysteresis.latches.insert(
            Trigger::WindPark,
            Latch {
                triggered: true,
                since: Some(now),
            },
        );
        journal.append(JournalKind::Verdict, &park_verdict(now)).unwrap();
        journal.append(JournalKind::Hysteresis, &hysteresis).unwrap();

        let recovered = journal.recover().unwrap();
        assert!(recovered.hysteresis.is_latched(Trigger::WindPark));
        assert_eq!(
            recovered.verdict.map(|v| v.level()),
            Some(VerdictLevel::ParkRequired)
        );
        assert_eq!(recovered.stage, EmergencyStage::Warning);
    }

    #[test]
    fn since_filters_by_time() {
        let journal = Journal::open_in_memory().unwrap();
        let now = Utc::now();
        journal
            .append_at(JournalKind::Stage, now - Duration::hours(2), &EmergencyStage::Park)
            .unwrap();
        journal
            .append_at(JournalKind::Stage, now, &EmergencyStage::Warning)
            .unwrap();

        let recent = journal.since(now - Duration::hours(1)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, JournalKind::Stage);
        assert_eq!(recent[0].payload, serde_json::json!("WARNING"));
    }

    #[test]
    fn since_includes_the_boundary_and_keeps_append_order() {
        let journal = Journal::open_in_memory().unwrap();
        let cutoff = Utc::now() - Duration::minutes(10);
        journal
            .append_at(JournalKind::Observation, cutoff - Duration::milliseconds(1), &"early")
            .unwrap();
        journal.append_at(JournalKind::Observation, cutoff, &"boundary").unwrap();
        journal
            .append_at(JournalKind::Session, cutoff + Duration::milliseconds(500), &"late")
            .unwrap();

        let entries = journal.since(cutoff).unwrap();
        let payloads: Vec<_> = entries.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![serde_json::json!("boundary"), serde_json::json!("late")]
        );
        assert!(entries[0].seq < entries[1].seq);
        assert_eq!(entries[1].kind, JournalKind::Session);
    }

    #[test]
    fn sequence_numbers_increase() {
        let journal = Journal::open_in_memory().unwrap();
        let a = journal.append(JournalKind::Observation, &1).unwrap();
        let b = journal.append(JournalKind::Observation, &2).unwrap();
        assert!(b > a);
        assert_eq!(journal.len().unwrap(), 2);
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        {
            let journal = Journal::open(&path).unwrap();
            journal.append(JournalKind::Stage, &EmergencyStage::Close).unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.recover().unwrap().stage, EmergencyStage::Close);
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let journal = Journal::open_in_memory().unwrap();
        journal.append(JournalKind::Stage, &"SIDEWAYS").unwrap();
        assert!(matches!(
            journal.recover(),
            Err(JournalError::Payload(_))
        ));
    }
}
