//! Durable job storage. Jobs persist across restarts so a
//! power cycle mid-dose doesn't lose the pending "turn it back off" job.
//!
//! Recovery is tiered: open the SQLite file; if it's corrupt, delete and
//! recreate it; if the directory itself isn't writable, fall back to an
//! in-memory store and keep running (logged at WARN by the caller — this
//! module only implements the mechanics).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::Job;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    Sqlite(String),
    Serde(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Sqlite(msg) => write!(f, "job store sqlite error: {msg}"),
            Error::Serde(msg) => write!(f, "job store serialization error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Persistence for scheduled jobs. `put` replaces any existing job sharing
/// the same id (replace-on-id semantics); `take_due` atomically
/// removes and returns every job whose `run_at` is at or before `now`,
/// since every job is one-shot.
pub trait JobStore: Send + Sync {
    fn put(&self, job: Job) -> Result<(), Error>;
    fn remove(&self, id: &str) -> Result<(), Error>;
    fn get(&self, id: &str) -> Result<Option<Job>, Error>;
    fn all(&self) -> Result<Vec<Job>, Error>;
    fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, Error>;
}

/// Fallback store used when the SQLite file can't be opened or recreated.
/// The process keeps running without durability rather than refusing to
/// start.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn put(&self, job: Job) -> Result<(), Error> {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), Error> {
        self.jobs.lock().unwrap().remove(id);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, Error> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    fn all(&self) -> Result<Vec<Job>, Error> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, Error> {
        let mut jobs = self.jobs.lock().unwrap();
        let due_ids: Vec<String> = jobs.iter().filter(|(_, j)| j.run_at <= now).map(|(id, _)| id.clone()).collect();
        Ok(due_ids.iter().filter_map(|id| jobs.remove(id)).collect())
    }
}

/// SQLite-backed store, one row per job, keyed by id. `kind` is the
/// serialized `JobKind` as JSON text — simpler than a column-per-variant
/// schema and plenty fast at this job count.
pub struct SqliteJobStore {
    conn: Mutex<rusqlite::Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    run_at TEXT NOT NULL,
    kind TEXT NOT NULL
)";

impl SqliteJobStore {
    fn open_at(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens the job store at `path`, recreating the file if it's present
    /// but corrupt, and handing back `None` if even a fresh file can't be
    /// created (e.g. the parent directory isn't writable) so the caller can
    /// fall back to [`MemoryJobStore`].
    pub fn open_with_recovery(path: &Path) -> Option<Self> {
        match Self::open_at(path) {
            Ok(store) => return Some(store),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "job store open failed, attempting recreate");
            }
        }

        let _ = std::fs::remove_file(path);
        match Self::open_at(path) {
            Ok(store) => Some(store),
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "job store recreate failed");
                None
            }
        }
    }
}

impl JobStore for SqliteJobStore {
    fn put(&self, job: Job) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let kind_json = serde_json::to_string(&job.kind)?;
        conn.execute("INSERT INTO jobs (id, run_at, kind) VALUES (?1, ?2, ?3)
                      ON CONFLICT(id) DO UPDATE SET run_at = excluded.run_at, kind = excluded.kind",
            rusqlite::params![job.id, job.run_at.to_rfc3339(), kind_json])?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, run_at, kind FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> Result<Vec<Job>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, run_at, kind FROM jobs")?;
        let rows = stmt.query_map([], row_to_job)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, Error> {
        let conn = self.conn.lock().unwrap();
        let now_str = now.to_rfc3339();
        let mut stmt = conn.prepare("SELECT id, run_at, kind FROM jobs WHERE run_at <= ?1")?;
        let rows = stmt.query_map(rusqlite::params![now_str], row_to_job)?;
        let mut due = Vec::new();
        for row in rows {
            due.push(row?);
        }
        drop(stmt);
        conn.execute("DELETE FROM jobs WHERE run_at <= ?1", rusqlite::params![now_str])?;
        Ok(due)
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let run_at_str: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let run_at = DateTime::parse_from_rfc3339(&run_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err)))?;
    let kind = serde_json::from_str(&kind_str)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err)))?;
    Ok(Job { id, run_at, kind })
}
