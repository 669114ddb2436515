//! Sensor model: the `Sensor` trait (a typed redesign of duck-typed
//! per-sensor classes), reading validation, and the snapshot store.

pub mod snapshot;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which physical quantity a sensor measures. `NPK` and `DO` are carried
/// even though no control loop consumes them yet — they still populate
/// the snapshot and are validated the same way, ready for a future loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Ec,
    Ph,
    Do,
    WaterLevel,
    Npk,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Ec => "ec",
            SensorKind::Ph => "ph",
            SensorKind::Do => "do",
            SensorKind::WaterLevel => "water_level",
            SensorKind::Npk => "npk",
        }
    }
}

/// A single sensor reading. `value: None` means the sensor is unreachable
/// or its reading is unreadable/invalid.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Reading {
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.timestamp) > max_age
    }
}

/// The narrow interface every sensor driver implements: a small trait
/// with tagged variants. Drivers live outside
/// the core (they talk to `SensorBus`); this trait is the seam a driver
/// plugs into to feed the snapshot store.
pub trait Sensor: Send + Sync {
    fn kind(&self) -> SensorKind;
    fn location(&self) -> &str;
    fn poll(&self) -> Reading;
    fn is_connected(&self) -> bool;
}

/// Polls every registered driver once and splices the result into the
/// snapshot document, called from `app.rs`'s 10s main loop tick.
/// A disconnected sensor writes a `None`-valued reading rather than being
/// skipped, so a stale/missing value is visible in the snapshot instead of
/// silently retaining the last good one.
pub fn scan_all(sensors: &[Box<dyn Sensor>], store: &dyn crate::ports::FileStore, path: &str, now: DateTime<Utc>) {
    for sensor in sensors {
        let reading = if sensor.is_connected() { sensor.poll() } else { Reading { value: None, timestamp: now } };
        if let Err(err) = snapshot::write_reading(store, path, sensor.kind(), sensor.location(), reading, now) {
            tracing::error!(error = %err, kind = ?sensor.kind(), location = sensor.location(), "failed to write sensor reading to snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MemoryFileStore;

    struct StubSensor {
        kind: SensorKind,
        location: &'static str,
        connected: bool,
        value: f64,
    }

    impl Sensor for StubSensor {
        fn kind(&self) -> SensorKind {
            self.kind
        }

        fn location(&self) -> &str {
            self.location
        }

        fn poll(&self) -> Reading {
            Reading { value: Some(self.value), timestamp: Utc::now() }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[test]
    fn is_stale_compares_against_max_age() {
        let now = Utc::now();
        let reading = Reading { value: Some(1.0), timestamp: now - chrono::Duration::seconds(90) };
        assert!(reading.is_stale(now, chrono::Duration::seconds(60)));
        assert!(!reading.is_stale(now, chrono::Duration::seconds(120)));
    }

    #[test]
    fn scan_all_writes_a_null_reading_for_a_disconnected_sensor() {
        let store = MemoryFileStore::new();
        let now = Utc::now();
        let sensors: Vec<Box<dyn Sensor>> = vec![Box::new(StubSensor { kind: SensorKind::Ec, location: "tank1", connected: false, value: 1.5 })];

        scan_all(&sensors, &store, "snapshot.json", now);

        let view = snapshot::read(&store, "snapshot.json");
        assert_eq!(view.latest(SensorKind::Ec).unwrap().value, None);
    }

    #[test]
    fn scan_all_writes_the_polled_value_for_a_connected_sensor() {
        let store = MemoryFileStore::new();
        let now = Utc::now();
        let sensors: Vec<Box<dyn Sensor>> = vec![Box::new(StubSensor { kind: SensorKind::Ph, location: "tank1", connected: true, value: 6.2 })];

        scan_all(&sensors, &store, "snapshot.json", now);

        let view = snapshot::read(&store, "snapshot.json");
        assert_eq!(view.latest(SensorKind::Ph).unwrap().value, Some(6.2));
    }
}
