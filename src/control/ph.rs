//! pH loop. Exactly one of the two pH pumps may be on
//! at a time; `ph_stop` always turns both off regardless of which one (if
//! any) was running.

use chrono::Duration;

use crate::control::{Deps, DOSING_PUMP_HARD_MAX_SECONDS};
use crate::scheduler::JobKind;
use crate::sensors::SensorKind;

const START_JOB: &str = "ph_start";
const STOP_JOB: &str = "ph_stop";
const STALE_AFTER: Duration = Duration::minutes(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decision {
    Up,
    Down,
    Skip,
}

fn decide(ph: f64, settings: &crate::config::Settings) -> Decision {
    if ph > settings.ph_max {
        return Decision::Down;
    }
    if ph < settings.ph_min {
        return Decision::Up;
    }
    let half_deadband = settings.ph_deadband / 2.0;
    if ph > settings.ph_target + half_deadband {
        Decision::Down
    } else if ph < settings.ph_target - half_deadband {
        Decision::Up
    } else {
        Decision::Skip
    }
}

/// Forces both pH pumps off at process boot regardless of config (spec
/// §4.2's startup invariant) — only a scheduled `ph_start` may turn one on.
pub fn on_boot(deps: &Deps) {
    if let Err(err) = deps.actuator.set_ph_plus_pump(false) {
        tracing::error!(error = %err, "failed to force pH-up pump off at boot");
    }
    if let Err(err) = deps.actuator.set_ph_minus_pump(false) {
        tracing::error!(error = %err, "failed to force pH-down pump off at boot");
    }
}

pub fn on_start(deps: &Deps) {
    if deps.settings.ph_pump_on_duration == 0 {
        return;
    }

    if deps.emergency_active() {
        tracing::warn!("ph_start skipped: emergency shutdown latched");
        reschedule_start(deps);
        return;
    }

    let reading = deps.snapshot().latest(SensorKind::Ph);
    let stale = reading.map(|r| r.is_stale(deps.now(), STALE_AFTER)).unwrap_or(true);
    let ph = match reading.and_then(|r| r.value) {
        Some(ph) if !stale => ph,
        _ => {
            tracing::info!("ph_start skipped: pH reading absent or stale");
            reschedule_start(deps);
            return;
        }
    };

    match decide(ph, deps.settings) {
        Decision::Up => dose(deps, "pHPlusPump", true, ph),
        Decision::Down => dose(deps, "pHMinusPump", false, ph),
        Decision::Skip => reschedule_start(deps),
    }
}

fn dose(deps: &Deps, label: &str, up: bool, ph: f64) {
    let planned = (deps.settings.ph_pump_on_duration as i64).min(DOSING_PUMP_HARD_MAX_SECONDS);
    if !deps.runtime_tracker().can_dose(planned, deps.now()) {
        tracing::warn!(pump = label, "ph dose skipped: daily dosing runtime budget exhausted");
        deps.audit.record(crate::audit::AuditEvent::new(
            crate::audit::EventType::Alarm,
            "daily_dosing_budget_exhausted",
            crate::audit::EventSource::Autonomous,
            deps.now(),
        ));
        reschedule_start(deps);
        return;
    }

    let result = if up { deps.actuator.set_ph_plus_pump(true) } else { deps.actuator.set_ph_minus_pump(true) };
    if let Err(err) = result {
        tracing::error!(error = %err, pump = label, "failed to start pH pump");
        return;
    }

    deps.audit.record(
        crate::audit::AuditEvent::new(crate::audit::EventType::Dosing, "ph_start", crate::audit::EventSource::Scheduled, deps.now())
            .with_resource(label)
            .with_value(serde_json::json!({ "ph": ph, "duration": deps.settings.ph_pump_on_duration })),
    );

    deps.stuck_detector.start_dosing("ph", ph);

    let max_runtime = Duration::seconds((deps.settings.ph_pump_on_duration as i64).min(DOSING_PUMP_HARD_MAX_SECONDS));
    deps.pump_monitor.start_pump(label, Some(max_runtime), deps.now());

    let stop_at = deps.now() + Duration::seconds(deps.settings.ph_pump_on_duration as i64);
    if let Err(err) = deps.scheduler.add_job(STOP_JOB, stop_at, JobKind::Stop) {
        tracing::error!(error = %err, "failed to schedule ph_stop, forcing pumps off immediately");
        force_stop(deps);
    }
}

pub fn on_stop(deps: &Deps) {
    force_stop(deps);
    reschedule_start(deps);
}

fn force_stop(deps: &Deps) {
    if let Err(err) = deps.actuator.set_ph_plus_pump(false) {
        tracing::error!(error = %err, "failed to stop pH-up pump");
    }
    if let Err(err) = deps.actuator.set_ph_minus_pump(false) {
        tracing::error!(error = %err, "failed to stop pH-down pump");
    }
    deps.pump_monitor.stop_pump("pHPlusPump");
    deps.pump_monitor.stop_pump("pHMinusPump");
    deps.runtime_tracker().add_dosing_event(deps.settings.ph_pump_on_duration as i64, deps.now());
    deps.audit.record(crate::audit::AuditEvent::new(crate::audit::EventType::Dosing, "ph_stop", crate::audit::EventSource::Scheduled, deps.now()));
    crate::control::mixing::nudge_after_dose(deps);
}

fn reschedule_start(deps: &Deps) {
    if deps.settings.ph_pump_wait_duration == 0 {
        return;
    }
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) {
        return;
    }
    let next = deps.now() + Duration::seconds(deps.settings.ph_pump_wait_duration as i64);
    if let Err(err) = deps.scheduler.add_job(START_JOB, next, JobKind::Start) {
        tracing::error!(error = %err, "failed to reschedule ph_start");
    }
}

/// Self-heal hook for the scheduler health check.
pub fn ensure_scheduled(deps: &Deps) {
    if deps.settings.ph_pump_on_duration == 0 {
        return;
    }
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) || deps.scheduler.has_job(STOP_JOB).unwrap_or(false) {
        return;
    }
    tracing::warn!("pH loop had no pending job, reinitializing schedule");
    reschedule_start(deps);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorFacade, MemoryRelayBackend};
    use crate::audit::MemoryAuditSink;
    use crate::config::{relay_assignments::RelayAssignments, Config, Settings};
    use crate::ports::{FakeClock, MemoryFileStore};
    use crate::safety::pump_timeout::PumpTimeoutMonitor;
    use crate::safety::stuck_sensor::StuckSensorDetector;
    use crate::scheduler::Scheduler;
    use crate::sensors::snapshot;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    struct Harness {
        _dir: tempfile::TempDir,
        actuator: ActuatorFacade,
        settings: Settings,
        store: MemoryFileStore,
        clock: FakeClock,
        audit: MemoryAuditSink,
        pump_monitor: PumpTimeoutMonitor,
        stuck_detector: StuckSensorDetector,
        scheduler: Scheduler,
    }

    fn harness(ph_max: f64, ph_target: f64, ph_deadband: f64, ph_min: f64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(
                format!(
                    "[RELAY_ASSIGNMENTS]\npHPlusPump = 0.0\npHMinusPump = 0.1\nMixingPump = 0.2\n[pH]\nph_target = {ph_target}, {ph_target}\nph_deadband = {ph_deadband}, {ph_deadband}\nph_min = {ph_min}, {ph_min}\nph_max = {ph_max}, {ph_max}\n[NutrientPump]\nph_pump_on_duration = 00:00:02, 00:00:02\nph_pump_wait_duration = 00:02:00, 00:02:00\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let config = Config::new(path.clone());
        let actuator = ActuatorFacade::new(RelayAssignments::new(config.clone()), Box::new(MemoryRelayBackend::new()));
        let settings = Settings::load(&config);
        Harness {
            _dir: dir,
            actuator,
            settings,
            store: MemoryFileStore::new(),
            clock: FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            audit: MemoryAuditSink::new(),
            pump_monitor: PumpTimeoutMonitor::new(),
            stuck_detector: StuckSensorDetector::new(),
            scheduler: Scheduler::in_memory(),
        }
    }

    fn deps(h: &Harness) -> Deps<'_> {
        Deps {
            actuator: &h.actuator,
            scheduler: &h.scheduler,
            file_store: &h.store,
            clock: &h.clock,
            audit: &h.audit,
            pump_monitor: &h.pump_monitor,
            stuck_detector: &h.stuck_detector,
            snapshot_path: "snapshot.json",
            runtime_tracker_path: "runtime.json",
            emergency_flag_path: "emergency.flag",
            settings: &h.settings,
        }
    }

    #[test]
    fn above_max_doses_down_only() {
        let h = harness(7.0, 6.5, 0.4, 4.0);
        snapshot::write_reading(&h.store, "snapshot.json", SensorKind::Ph, "tank1", crate::sensors::Reading { value: Some(7.5), timestamp: h.clock.now() }, h.clock.now()).unwrap();

        on_start(&deps(&h));

        assert!(h.actuator.get_relay_state("pHMinusPump").unwrap().is_on());
        assert!(!h.actuator.get_relay_state("pHPlusPump").unwrap().is_on());
        assert!(h.scheduler.has_job(STOP_JOB).unwrap());
    }

    #[test]
    fn inside_deadband_skips() {
        let h = harness(8.0, 6.0, 0.4, 4.0);
        snapshot::write_reading(&h.store, "snapshot.json", SensorKind::Ph, "tank1", crate::sensors::Reading { value: Some(6.0), timestamp: h.clock.now() }, h.clock.now()).unwrap();

        on_start(&deps(&h));

        assert!(!h.actuator.get_relay_state("pHPlusPump").unwrap().is_on());
        assert!(!h.actuator.get_relay_state("pHMinusPump").unwrap().is_on());
        assert!(h.scheduler.has_job(START_JOB).unwrap());
    }

    #[test]
    fn stale_reading_never_doses() {
        let h = harness(7.0, 6.5, 0.4, 4.0);
        let old = h.clock.now() - Duration::minutes(10);
        snapshot::write_reading(&h.store, "snapshot.json", SensorKind::Ph, "tank1", crate::sensors::Reading { value: Some(8.0), timestamp: old }, old).unwrap();

        on_start(&deps(&h));

        assert!(!h.actuator.get_relay_state("pHPlusPump").unwrap().is_on());
        assert!(!h.actuator.get_relay_state("pHMinusPump").unwrap().is_on());
    }

    #[test]
    fn stop_always_clears_both_pumps() {
        let h = harness(7.0, 6.5, 0.4, 4.0);
        h.actuator.set_ph_plus_pump(true).unwrap();

        on_stop(&deps(&h));

        assert!(!h.actuator.get_relay_state("pHPlusPump").unwrap().is_on());
        assert!(!h.actuator.get_relay_state("pHMinusPump").unwrap().is_on());
    }

    #[test]
    fn boot_forces_both_pumps_off() {
        let h = harness(7.0, 6.5, 0.4, 4.0);
        h.actuator.set_ph_plus_pump(true).unwrap();
        h.actuator.set_ph_minus_pump(true).unwrap();

        on_boot(&deps(&h));

        assert!(!h.actuator.get_relay_state("pHPlusPump").unwrap().is_on());
        assert!(!h.actuator.get_relay_state("pHMinusPump").unwrap().is_on());
    }
}
