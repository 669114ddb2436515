//! Sensor snapshot store: the single on-disk JSON document every control
//! loop reads the freshest sensor values from.
//!
//! Layout (byte-exact keys matter for interop with the host dashboard):
//! ```json
//! {
//!   "data": {
//!     "water_metrics": {
//!       "ec": { "measurements": { "points": [ { "location": "tank1", "fields": { "value": 1.2 }, "timestamp": "..." } ] } },
//!       "ph": { ... },
//!       "water_level": { ... }
//!     }
//!   },
//!   "last_updated": "..."
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Reading, SensorKind};
use crate::ports::FileStore;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "snapshot io error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Fields {
    value: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Point {
    location: String,
    fields: Fields,
    timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Measurements {
    points: Vec<Point>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct KindMetrics {
    measurements: Measurements,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WaterMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ec: Option<KindMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ph: Option<KindMetrics>,
    #[serde(default, rename = "water_level", skip_serializing_if = "Option::is_none")]
    water_level: Option<KindMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    npk: Option<KindMetrics>,
    #[serde(default, rename = "dissolved_oxygen", skip_serializing_if = "Option::is_none")]
    dissolved_oxygen: Option<KindMetrics>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Data {
    #[serde(default)]
    water_metrics: WaterMetrics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    data: Data,
    last_updated: DateTime<Utc>,
}

impl Default for Document {
    fn default() -> Self {
        Self { data: Data::default(), last_updated: Utc::now() }
    }
}

fn metrics_slot_mut(metrics: &mut WaterMetrics, kind: SensorKind) -> &mut Option<KindMetrics> {
    match kind {
        SensorKind::Ec => &mut metrics.ec,
        SensorKind::Ph => &mut metrics.ph,
        SensorKind::WaterLevel => &mut metrics.water_level,
        SensorKind::Npk => &mut metrics.npk,
        SensorKind::Do => &mut metrics.dissolved_oxygen,
    }
}

fn metrics_slot(metrics: &WaterMetrics, kind: SensorKind) -> Option<&KindMetrics> {
    match kind {
        SensorKind::Ec => metrics.ec.as_ref(),
        SensorKind::Ph => metrics.ph.as_ref(),
        SensorKind::WaterLevel => metrics.water_level.as_ref(),
        SensorKind::Npk => metrics.npk.as_ref(),
        SensorKind::Do => metrics.dissolved_oxygen.as_ref(),
    }
}

/// An in-memory view of the snapshot, produced by [`read`]. Readers must
/// tolerate a missing, empty, truncated, or garbage snapshot file and fall
/// back to an empty view — that fallback happens inside `read`,
/// never here.
#[derive(Clone, Debug, Default)]
pub struct SnapshotView {
    document: Document,
}

impl SnapshotView {
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.document.last_updated
    }

    pub fn get(&self, kind: SensorKind, location: &str) -> Option<Reading> {
        let slot = metrics_slot(&self.document.data.water_metrics, kind)?;
        let point = slot.measurements.points.iter().find(|p| p.location == location)?;
        Some(Reading { value: point.fields.value, timestamp: point.timestamp })
    }

    /// Convenience accessor for the single-tank deployments this crate
    /// targets: the first point recorded for `kind`, regardless of
    /// location name (mirrors `points[0]` in the on-disk document's layout).
    pub fn latest(&self, kind: SensorKind) -> Option<Reading> {
        let slot = metrics_slot(&self.document.data.water_metrics, kind)?;
        let point = slot.measurements.points.first()?;
        Some(Reading { value: point.fields.value, timestamp: point.timestamp })
    }

    pub fn all(&self, kind: SensorKind) -> HashMap<String, Reading> {
        let mut out = HashMap::new();
        if let Some(slot) = metrics_slot(&self.document.data.water_metrics, kind) {
            for point in &slot.measurements.points {
                out.insert(point.location.clone(), Reading { value: point.fields.value, timestamp: point.timestamp });
            }
        }
        out
    }
}

/// Reads the snapshot file, tolerating any form of corruption by yielding
/// an empty view (logged by the caller — this function only returns the
/// outcome, it doesn't itself log, so it stays usable from tests).
pub fn read(store: &dyn FileStore, path: &str) -> SnapshotView {
    let Ok(bytes) = store.read(path) else {
        return SnapshotView::default();
    };
    match serde_json::from_slice::<Document>(&bytes) {
        Ok(document) => SnapshotView { document },
        Err(_) => SnapshotView::default(),
    }
}

/// Splices a new measurement into the snapshot at its keyed path and
/// atomically replaces the file (invariant I7: never leave partial JSON).
/// Readers may observe either the pre- or post-write file, never a torn
/// one, because `FileStore::write_atomic` writes to a temp path and renames.
pub fn write_reading(store: &dyn FileStore, path: &str, kind: SensorKind, location: &str, reading: Reading, now: DateTime<Utc>) -> Result<(), Error> {
    let mut view = read(store, path);
    let slot = metrics_slot_mut(&mut view.document.data.water_metrics, kind).get_or_insert_with(KindMetrics::default);

    if let Some(existing) = slot.measurements.points.iter_mut().find(|p| p.location == location) {
        existing.fields.value = reading.value;
        existing.timestamp = reading.timestamp;
    } else {
        slot.measurements.points.push(Point { location: location.to_string(), fields: Fields { value: reading.value }, timestamp: reading.timestamp });
    }

    view.document.last_updated = now;

    let bytes = serde_json::to_vec(&view.document).expect("snapshot document always serializes");
    store.write_atomic(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MemoryFileStore;

    const PATH: &str = "snapshot.json";

    #[test]
    fn missing_file_yields_empty_view() {
        let store = MemoryFileStore::new();
        let view = read(&store, PATH);
        assert!(view.latest(SensorKind::Ec).is_none());
    }

    #[test]
    fn garbage_file_yields_empty_view() {
        let store = MemoryFileStore::new();
        store.write_atomic(PATH, b"{ not json").unwrap();
        let view = read(&store, PATH);
        assert!(view.latest(SensorKind::Ec).is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let store = MemoryFileStore::new();
        let now = Utc::now();
        write_reading(&store, PATH, SensorKind::Ec, "tank1", Reading { value: Some(1.23), timestamp: now }, now).unwrap();

        let view = read(&store, PATH);
        let reading = view.get(SensorKind::Ec, "tank1").unwrap();
        assert_eq!(reading.value, Some(1.23));
        assert_eq!(view.latest(SensorKind::Ec).unwrap().value, Some(1.23));
    }

    #[test]
    fn splicing_one_kind_does_not_disturb_another() {
        let store = MemoryFileStore::new();
        let now = Utc::now();
        write_reading(&store, PATH, SensorKind::Ec, "tank1", Reading { value: Some(1.0), timestamp: now }, now).unwrap();
        write_reading(&store, PATH, SensorKind::Ph, "tank1", Reading { value: Some(6.0), timestamp: now }, now).unwrap();

        let view = read(&store, PATH);
        assert_eq!(view.latest(SensorKind::Ec).unwrap().value, Some(1.0));
        assert_eq!(view.latest(SensorKind::Ph).unwrap().value, Some(6.0));
    }

    #[test]
    fn null_value_reading_round_trips_as_unreadable() {
        let store = MemoryFileStore::new();
        let now = Utc::now();
        write_reading(&store, PATH, SensorKind::WaterLevel, "tank1", Reading { value: None, timestamp: now }, now).unwrap();
        let view = read(&store, PATH);
        assert_eq!(view.latest(SensorKind::WaterLevel).unwrap().value, None);
    }
}
