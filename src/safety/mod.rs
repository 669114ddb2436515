//! Safety layer: pump-timeout monitoring, the daily
//! dosing budget, stuck-sensor detection, the emergency-shutdown latch,
//! and the critical-phase lock. Sensor validation lives in
//! `sensors::validation` and is re-exported here since every control loop
//! reaches for it alongside the rest of the safety layer.

pub mod emergency;
pub mod pump_timeout;
pub mod runtime_tracker;
pub mod stuck_sensor;

pub use crate::sensors::validation;

use crate::actuator::ActuatorFacade;

/// The five pumps that dose directly into the tank. A running pump from
/// this set puts the system in a "critical phase" during which manual
/// commands are rejected (the critical-phase lock).
pub const DOSING_PUMPS: [&str; 5] = ["NutrientPumpA", "NutrientPumpB", "NutrientPumpC", "pHPlusPump", "pHMinusPump"];

/// True if any dosing pump currently reads on. A relay read failure is
/// treated as "not on" rather than aborting the scan — a single flaky
/// relay read must not make the whole system refuse commands forever.
pub fn is_in_critical_phase(actuator: &ActuatorFacade) -> bool {
    DOSING_PUMPS.iter().any(|pump| matches!(actuator.get_relay_state(pump), Ok(state) if state.is_on()))
}

pub fn can_accept_new_command(actuator: &ActuatorFacade) -> bool {
    !is_in_critical_phase(actuator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MemoryRelayBackend;
    use crate::config::{relay_assignments::RelayAssignments, Config};
    use std::io::Write;

    fn facade() -> (tempfile::TempDir, ActuatorFacade) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.0\npHPlusPump = 0.1\nMixingPump = 0.2\n")
            .unwrap();
        let assignments = RelayAssignments::new(Config::new(path));
        (dir, ActuatorFacade::new(assignments, Box::new(MemoryRelayBackend::new())))
    }

    #[test]
    fn no_dosing_pump_on_means_not_critical() {
        let (_dir, actuator) = facade();
        actuator.set_mixing_pump(true).unwrap();
        assert!(!is_in_critical_phase(&actuator));
        assert!(can_accept_new_command(&actuator));
    }

    #[test]
    fn any_dosing_pump_on_blocks_new_commands() {
        let (_dir, actuator) = facade();
        actuator.set_ph_plus_pump(true).unwrap();
        assert!(is_in_critical_phase(&actuator));
        assert!(!can_accept_new_command(&actuator));
    }
}
