//! Daily dosing-runtime budget. All dosing pumps share one
//! combined 60-minute daily cap; history is a date-keyed JSON map,
//! persisted through the same [`FileStore`] abstraction as the sensor
//! snapshot so it gets the same atomic-write guarantee.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ports::FileStore;

pub const DAILY_LIMIT_SECONDS: i64 = 3600;

fn date_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Loads, queries, and updates the per-day dosing runtime history at
/// `path`. Every call re-reads and re-writes the file — like
/// [`crate::config::Config`], this keeps the file itself authoritative and
/// needs no in-process cache invalidation story.
pub struct RuntimeTracker<'a> {
    store: &'a dyn FileStore,
    path: String,
}

impl<'a> RuntimeTracker<'a> {
    pub fn new(store: &'a dyn FileStore, path: impl Into<String>) -> Self {
        Self { store, path: path.into() }
    }

    fn load(&self) -> BTreeMap<String, i64> {
        match self.store.read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, history: &BTreeMap<String, i64>) {
        if let Ok(bytes) = serde_json::to_vec_pretty(history) {
            if let Err(err) = self.store.write_atomic(&self.path, &bytes) {
                tracing::error!(error = %err, path = %self.path, "failed to persist dosing runtime history");
            }
        }
    }

    pub fn today_total_runtime(&self, now: DateTime<Utc>) -> i64 {
        *self.load().get(&date_key(now)).unwrap_or(&0)
    }

    /// Records a completed dosing event against today's total.
    pub fn add_dosing_event(&self, duration_seconds: i64, now: DateTime<Utc>) {
        let mut history = self.load();
        let key = date_key(now);
        *history.entry(key).or_insert(0) += duration_seconds;
        self.save(&history);
    }

    /// True if starting a dose of `planned_duration` seconds would keep
    /// today's combined dosing runtime within [`DAILY_LIMIT_SECONDS`].
    pub fn can_dose(&self, planned_duration_seconds: i64, now: DateTime<Utc>) -> bool {
        self.today_total_runtime(now) + planned_duration_seconds <= DAILY_LIMIT_SECONDS
    }
}
