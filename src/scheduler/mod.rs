//! Restart-safe job scheduler. Jobs are one-shot and
//! date-triggered: a control loop schedules "run again at T" or "turn this
//! relay off at T" and the scheduler's only job is to hand back whatever is
//! due each tick. There is no background thread here — `app.rs`'s main
//! loop drives `Scheduler::tick`, a cooperative-loop style chosen
//! over per-station timers.

pub mod store;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::store::{JobStore, MemoryJobStore, SqliteJobStore};

pub use self::store::Error;

/// What a job does once it comes due. The job's
/// `id` string carries which actuator/phase it belongs to (e.g.
/// `"nutrient_start"`, `"ph_stop"`, `"water_level_check"`) — the scheduler
/// itself stays control-loop-agnostic; `app.rs` dispatches by `id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Start,
    Stop,
    Check,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub run_at: DateTime<Utc>,
    pub kind: JobKind,
}

/// Thin wrapper around a [`JobStore`] with the replace-on-id add semantics
/// and due-job polling every control loop and `app.rs`'s main tick uses.
pub struct Scheduler {
    store: Box<dyn JobStore>,
}

impl Scheduler {
    pub fn new(store: Box<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Opens the durable SQLite-backed store at `path`, falling back to an
    /// in-memory store (and logging a warning) if the file can't be opened
    /// or recreated — the process still runs, just without durability
    /// across restarts (see the tiered recovery in `store.rs`).
    pub fn open(path: &Path) -> Self {
        match SqliteJobStore::open_with_recovery(path) {
            Some(store) => Self::new(Box::new(store)),
            None => {
                tracing::warn!(path = %path.display(), "falling back to in-memory job store, jobs will not survive a restart");
                Self::new(Box::new(MemoryJobStore::new()))
            }
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryJobStore::new()))
    }

    /// Schedules `kind` to run at `run_at` under `id`, replacing any job
    /// already scheduled under that id (a loop re-arming its own next run
    /// is the common case).
    pub fn add_job(&self, id: impl Into<String>, run_at: DateTime<Utc>, kind: JobKind) -> Result<(), Error> {
        self.store.put(Job { id: id.into(), run_at, kind })
    }

    pub fn remove_job(&self, id: &str) -> Result<(), Error> {
        self.store.remove(id)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>, Error> {
        self.store.get(id)
    }

    pub fn get_jobs(&self) -> Result<Vec<Job>, Error> {
        self.store.all()
    }

    /// Removes and returns every job due at or before `now`. Callers
    /// dispatch each returned job exactly once; a job that needs to recur
    /// re-schedules itself under the same id from within its handler.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Job>, Error> {
        self.store.take_due(now)
    }

    /// True if a job is scheduled under `id` at all, regardless of when it
    /// fires — used by the ~60s scheduler health check to detect a loop
    /// whose job silently fell out of the store.
    pub fn has_job(&self, id: &str) -> Result<bool, Error> {
        Ok(self.store.get(id)?.is_some())
    }
}
