//! Pump-timeout monitor. Tracks every currently-running
//! pump's start time and a per-pump max runtime; a pump that overruns its
//! cap trips the emergency latch rather than merely logging, since an
//! overrun dosing pump is a chemical safety hazard, not a recoverable
//! fault.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

struct ActivePump {
    started_at: DateTime<Utc>,
    max_runtime: Option<chrono::Duration>,
}

/// Process-wide registry of running pumps. One instance is shared across
/// every control loop through `app.rs`'s dependency injection — there is
/// no global/static instance — `Ripple` owns it and threads it through.
#[derive(Default)]
pub struct PumpTimeoutMonitor {
    active: Mutex<HashMap<String, ActivePump>>,
}

impl PumpTimeoutMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_pump(&self, pump_name: &str, max_runtime: Option<chrono::Duration>, now: DateTime<Utc>) {
        self.active.lock().unwrap().insert(pump_name.to_string(), ActivePump { started_at: now, max_runtime });
    }

    pub fn stop_pump(&self, pump_name: &str) {
        self.active.lock().unwrap().remove(pump_name);
    }

    pub fn is_active(&self, pump_name: &str) -> bool {
        self.active.lock().unwrap().contains_key(pump_name)
    }

    /// Returns the name and overrun duration of every pump that has
    /// exceeded its configured max runtime, without clearing their active
    /// state — the caller (safety sweep in `app.rs`) is expected to trigger
    /// an emergency shutdown, which stops every pump and makes further
    /// monitoring moot.
    pub fn timed_out_pumps(&self, now: DateTime<Utc>) -> Vec<(String, chrono::Duration)> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(name, pump)| {
                let max_runtime = pump.max_runtime?;
                let runtime = now.signed_duration_since(pump.started_at);
                (runtime > max_runtime).then(|| (name.clone(), runtime))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pump_with_no_max_runtime_never_times_out() {
        let monitor = PumpTimeoutMonitor::new();
        let t0 = Utc::now();
        monitor.start_pump("MixingPump", None, t0);
        assert!(monitor.timed_out_pumps(t0 + Duration::hours(5)).is_empty());
    }

    #[test]
    fn pump_exceeding_max_runtime_is_reported() {
        let monitor = PumpTimeoutMonitor::new();
        let t0 = Utc::now();
        monitor.start_pump("NutrientPumpA", Some(Duration::seconds(30)), t0);

        assert!(monitor.timed_out_pumps(t0 + Duration::seconds(20)).is_empty());

        let timed_out = monitor.timed_out_pumps(t0 + Duration::seconds(35));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].0, "NutrientPumpA");
    }

    #[test]
    fn stop_pump_removes_it_from_monitoring() {
        let monitor = PumpTimeoutMonitor::new();
        let t0 = Utc::now();
        monitor.start_pump("pHPlusPump", Some(Duration::seconds(10)), t0);
        monitor.stop_pump("pHPlusPump");
        assert!(!monitor.is_active("pHPlusPump"));
        assert!(monitor.timed_out_pumps(t0 + Duration::seconds(30)).is_empty());
    }
}
