//! Stuck-sensor detector. A dosing pump that
//! runs without moving its target sensor by more than `CHANGE_THRESHOLD`
//! for `MAX_RUNTIME_WITHOUT_CHANGE` seconds is almost certainly dosing
//! into empty air or a broken line — worth an alert distinct from the
//! hard pump-runtime cap.

use std::collections::HashMap;
use std::sync::Mutex;

pub const MAX_RUNTIME_WITHOUT_CHANGE_SECONDS: i64 = 60;
pub const CHANGE_THRESHOLD: f64 = 0.01;

struct Tracked {
    baseline_value: f64,
    accumulated_runtime_seconds: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckResult {
    pub stuck: bool,
    pub sensor_responding: bool,
}

/// Per-sensor dosing-response tracking, keyed by sensor name (e.g. `"ec"`,
/// `"ph"`). One instance is shared across the nutrient and pH control
/// loops through dependency injection.
#[derive(Default)]
pub struct StuckSensorDetector {
    sensors: Mutex<HashMap<String, Tracked>>,
}

impl StuckSensorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a dosing cycle for `sensor_name`, recording
    /// `initial_value` as the new baseline to measure change against.
    pub fn start_dosing(&self, sensor_name: &str, initial_value: f64) {
        let mut sensors = self.sensors.lock().unwrap();
        sensors
            .entry(sensor_name.to_string())
            .and_modify(|tracked| tracked.baseline_value = initial_value)
            .or_insert(Tracked { baseline_value: initial_value, accumulated_runtime_seconds: 0 });
    }

    /// Checks whether `sensor_name` has moved since its baseline. A change
    /// past [`CHANGE_THRESHOLD`] resets the accumulated runtime; otherwise
    /// `runtime_seconds` (time elapsed since the last check) accrues, and
    /// once it reaches [`MAX_RUNTIME_WITHOUT_CHANGE_SECONDS`] the sensor is
    /// reported stuck.
    pub fn check_sensor_response(&self, sensor_name: &str, current_value: f64, runtime_seconds: i64) -> CheckResult {
        let mut sensors = self.sensors.lock().unwrap();
        let Some(tracked) = sensors.get_mut(sensor_name) else {
            return CheckResult { stuck: false, sensor_responding: false };
        };

        if (current_value - tracked.baseline_value).abs() > CHANGE_THRESHOLD {
            tracked.accumulated_runtime_seconds = 0;
            tracked.baseline_value = current_value;
            CheckResult { stuck: false, sensor_responding: true }
        } else {
            tracked.accumulated_runtime_seconds += runtime_seconds;
            let stuck = tracked.accumulated_runtime_seconds >= MAX_RUNTIME_WITHOUT_CHANGE_SECONDS;
            if stuck {
                tracing::error!(sensor_name, baseline = tracked.baseline_value, runtime = tracked.accumulated_runtime_seconds, "stuck sensor detected");
            }
            CheckResult { stuck, sensor_responding: false }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sensor_never_reports_stuck() {
        let detector = StuckSensorDetector::new();
        let result = detector.check_sensor_response("ec", 1.5, 10);
        assert_eq!(result, CheckResult { stuck: false, sensor_responding: false });
    }

    #[test]
    fn value_change_past_threshold_resets_accumulation() {
        let detector = StuckSensorDetector::new();
        detector.start_dosing("ec", 1.0);
        detector.check_sensor_response("ec", 1.0, 50);
        let result = detector.check_sensor_response("ec", 1.2, 5);
        assert!(result.sensor_responding);
        assert!(!result.stuck);
    }

    #[test]
    fn unchanged_value_accumulates_to_stuck() {
        let detector = StuckSensorDetector::new();
        detector.start_dosing("ph", 6.0);
        assert!(!detector.check_sensor_response("ph", 6.005, 30).stuck);
        assert!(detector.check_sensor_response("ph", 6.005, 30).stuck);
    }

    #[test]
    fn change_exactly_at_threshold_does_not_count_as_responding() {
        let detector = StuckSensorDetector::new();
        detector.start_dosing("ec", 1.0);
        let result = detector.check_sensor_response("ec", 1.01, 60);
        assert!(!result.sensor_responding);
        assert!(result.stuck);
    }
}
