use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use models::{Environment, FileMeta};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("matcher state database failed")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode submission record")]
    Encode(#[from] serde_json::Error),
}

/// The in-progress (or last-dispatched) state of one artifact key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub artifact: String,
    pub project: String,
    pub sample_id: String,
    pub run_id: String,
    pub platform: String,
    pub site: String,
    pub env: Environment,
    pub uuid: Uuid,
    /// Extension to most-recently-seen file.
    pub files: BTreeMap<String, FileMeta>,
    pub uploaders: BTreeSet<String>,
}

impl Submission {
    pub fn etags(&self) -> BTreeMap<&str, &str> {
        self.files
            .iter()
            .map(|(ext, meta)| (ext.as_str(), meta.etag.as_str()))
            .collect()
    }
}

/// Durable matcher state. Two tables: `pending` holds working records
/// whose file sets are still incomplete (or complete-but-suppressed), and
/// `dispatched` holds the full record as last emitted, which both detects
/// identical re-submissions and seeds the re-opened record when a file is
/// re-uploaded.
pub struct StateStore {
    conn: Connection,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending (
    artifact   TEXT PRIMARY KEY,
    record     TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS dispatched (
    artifact      TEXT PRIMARY KEY,
    record        TEXT NOT NULL,
    dispatched_at INTEGER NOT NULL
);
"#;

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StateError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn pending(&self, artifact: &str) -> Result<Option<Submission>, StateError> {
        self.fetch("SELECT record FROM pending WHERE artifact = ?1", artifact)
    }

    pub fn dispatched(&self, artifact: &str) -> Result<Option<Submission>, StateError> {
        self.fetch("SELECT record FROM dispatched WHERE artifact = ?1", artifact)
    }

    fn fetch(&self, sql: &str, artifact: &str) -> Result<Option<Submission>, StateError> {
        let row: Option<String> = self
            .conn
            .query_row(sql, params![artifact], |row| row.get(0))
            .optional()?;

        match row {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    pub fn save_pending(
        &self,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO pending (artifact, record, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (artifact) DO UPDATE SET record = ?2, updated_at = ?3",
            params![
                submission.artifact,
                serde_json::to_string(submission)?,
                now.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn clear_pending(&self, artifact: &str) -> Result<(), StateError> {
        self.conn
            .execute("DELETE FROM pending WHERE artifact = ?1", params![artifact])?;
        Ok(())
    }

    /// Record a dispatch: the emitted record becomes the re-submission
    /// baseline and the working record is cleared.
    pub fn record_dispatch(
        &self,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO dispatched (artifact, record, dispatched_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (artifact) DO UPDATE SET record = ?2, dispatched_at = ?3",
            params![
                submission.artifact,
                serde_json::to_string(submission)?,
                now.timestamp(),
            ],
        )?;
        self.clear_pending(&submission.artifact)
    }

    /// Drop working records with no activity since `cutoff`, returning the
    /// expired artifact keys.
    pub fn expire_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT artifact FROM pending WHERE updated_at < ?1")?;
        let expired: Vec<String> = stmt
            .query_map(params![cutoff.timestamp()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        self.conn.execute(
            "DELETE FROM pending WHERE updated_at < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(expired)
    }
}
