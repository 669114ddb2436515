//! Nutrient dosing loop. Hysteresis dosing keeps EC at or
//! above target using the configured A:B:C pump ratio.

use chrono::Duration;

use crate::control::{Deps, DOSING_PUMP_HARD_MAX_SECONDS};
use crate::safety::validation::is_valid_ec;
use crate::scheduler::JobKind;
use crate::sensors::SensorKind;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const START_JOB: &str = "nutrient_start";
const STOP_JOB: &str = "nutrient_stop";
const LOCATION: &str = "tank1";

/// Advisory EC min/max alerts are debounced at this interval
/// so a prolonged excursion doesn't flood the audit trail every cycle.
const ADVISORY_DEBOUNCE_SECONDS: i64 = 600;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decision {
    Dose,
    Skip,
}

/// Owns the one persistent bit this loop needs across triggers: the
/// hysteresis flag. Defaults to `true` so a restart mid-recovery keeps
/// dosing rather than silently giving up.
pub struct NutrientLoop {
    dosing_active: AtomicBool,
    last_advisory_alarm: Mutex<Option<DateTime<Utc>>>,
}

impl Default for NutrientLoop {
    fn default() -> Self {
        Self { dosing_active: AtomicBool::new(true), last_advisory_alarm: Mutex::new(None) }
    }
}

impl NutrientLoop {
    pub fn new() -> Self {
        Self::default()
    }

    fn decide(&self, ec: f64, settings: &crate::config::Settings) -> Decision {
        let lower = settings.ec_target - settings.ec_deadband;
        if ec < lower {
            Decision::Dose
        } else if ec < settings.ec_target {
            if self.dosing_active.load(Ordering::SeqCst) {
                Decision::Dose
            } else {
                Decision::Skip
            }
        } else {
            Decision::Skip
        }
    }

    /// `nutrient_start` fires: reads EC, decides dose/skip, actuates.
    pub fn on_start(&self, deps: &Deps) {
        if deps.settings.nutrient_pump_on_duration == 0 {
            return; // loop disabled, no jobs scheduled
        }

        if deps.emergency_active() {
            tracing::warn!("nutrient_start skipped: emergency shutdown latched");
            self.reschedule_start(deps);
            return;
        }

        let reading = deps.snapshot().latest(SensorKind::Ec);
        let ec = match reading.and_then(|r| r.value) {
            Some(ec) if is_valid_ec(Some(ec)) => ec,
            _ => {
                tracing::info!("nutrient_start skipped: EC reading absent or invalid");
                self.reschedule_start(deps);
                return;
            }
        };

        if ec < deps.settings.ec_min || ec > deps.settings.ec_max {
            self.maybe_emit_advisory_alarm(deps, ec);
        }

        match self.decide(ec, deps.settings) {
            Decision::Dose => self.dose(deps, ec),
            Decision::Skip => {
                self.dosing_active.store(false, Ordering::SeqCst);
                self.reschedule_start(deps);
            }
        }
    }

    /// Emits `ec_out_of_advisory_range`, debounced so a
    /// prolonged excursion doesn't re-alarm every evaluation cycle.
    fn maybe_emit_advisory_alarm(&self, deps: &Deps, ec: f64) {
        let now = deps.now();
        let mut last = self.last_advisory_alarm.lock().unwrap();
        if let Some(previous) = *last {
            if now.signed_duration_since(previous) < Duration::seconds(ADVISORY_DEBOUNCE_SECONDS) {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        deps.audit.record(
            crate::audit::AuditEvent::new(crate::audit::EventType::Alarm, "ec_out_of_advisory_range", crate::audit::EventSource::Autonomous, now)
                .with_value(serde_json::json!({ "ec": ec, "min": deps.settings.ec_min, "max": deps.settings.ec_max })),
        );
    }

    fn dose(&self, deps: &Deps, ec: f64) {
        let planned = (deps.settings.nutrient_pump_on_duration as i64).min(DOSING_PUMP_HARD_MAX_SECONDS);
        if !deps.runtime_tracker().can_dose(planned, deps.now()) {
            tracing::warn!("nutrient dose skipped: daily dosing runtime budget exhausted");
            deps.audit.record(crate::audit::AuditEvent::new(
                crate::audit::EventType::Alarm,
                "daily_dosing_budget_exhausted",
                crate::audit::EventSource::Autonomous,
                deps.now(),
            ));
            self.reschedule_start(deps);
            return;
        }

        self.dosing_active.store(true, Ordering::SeqCst);

        let [a, b, c] = deps.settings.abc_ratio;
        let commands: Vec<(&str, bool)> = [("NutrientPumpA", a), ("NutrientPumpB", b), ("NutrientPumpC", c)]
            .into_iter()
            .map(|(name, share)| (name, share > 0))
            .collect();
        if let Err(err) = deps.actuator.set_multiple_relays(&commands) {
            tracing::error!(error = %err, "failed to start nutrient pumps");
        }

        deps.audit.record(
            crate::audit::AuditEvent::new(crate::audit::EventType::Dosing, "nutrient_start", crate::audit::EventSource::Scheduled, deps.now())
                .with_value(serde_json::json!({ "abc_ratio": [a, b, c], "duration": deps.settings.nutrient_pump_on_duration, "ec": ec })),
        );

        deps.stuck_detector.start_dosing("ec", ec);

        let max_runtime = Duration::seconds((deps.settings.nutrient_pump_on_duration as i64).min(DOSING_PUMP_HARD_MAX_SECONDS));
        for pump in ["NutrientPumpA", "NutrientPumpB", "NutrientPumpC"] {
            deps.pump_monitor.start_pump(pump, Some(max_runtime), deps.now());
        }

        let stop_at = deps.now() + Duration::seconds(deps.settings.nutrient_pump_on_duration as i64);
        if let Err(err) = deps.scheduler.add_job(STOP_JOB, stop_at, JobKind::Stop) {
            tracing::error!(error = %err, "failed to schedule nutrient_stop, forcing pumps off immediately");
            self.force_stop(deps);
        }
    }

    /// `nutrient_stop` fires: turns every nutrient pump off and reschedules
    /// the next check.
    pub fn on_stop(&self, deps: &Deps) {
        self.force_stop(deps);
        self.reschedule_start(deps);
    }

    fn force_stop(&self, deps: &Deps) {
        if let Err(err) = deps.actuator.set_nutrient_pumps(false) {
            tracing::error!(error = %err, "failed to stop nutrient pumps");
        }
        for pump in ["NutrientPumpA", "NutrientPumpB", "NutrientPumpC"] {
            deps.pump_monitor.stop_pump(pump);
        }
        deps.runtime_tracker().add_dosing_event(deps.settings.nutrient_pump_on_duration as i64, deps.now());
        deps.audit.record(crate::audit::AuditEvent::new(crate::audit::EventType::Dosing, "nutrient_stop", crate::audit::EventSource::Scheduled, deps.now()));
        crate::control::mixing::nudge_after_dose(deps);
    }

    fn reschedule_start(&self, deps: &Deps) {
        if deps.settings.nutrient_pump_wait_duration == 0 {
            return; // explicit disable: run once, don't reschedule
        }
        if deps.scheduler.has_job(START_JOB).unwrap_or(false) {
            return; // idempotent: don't replace an already-pending start
        }
        let next = deps.now() + Duration::seconds(deps.settings.nutrient_pump_wait_duration as i64);
        if let Err(err) = deps.scheduler.add_job(START_JOB, next, JobKind::Start) {
            tracing::error!(error = %err, "failed to reschedule nutrient_start");
        }
    }

    /// Self-heal hook for the scheduler health check: if the loop
    /// is enabled but neither `nutrient_start` nor `nutrient_stop` is
    /// pending, the scheduler's durable store was wiped out from under it.
    pub fn ensure_scheduled(&self, deps: &Deps) {
        if deps.settings.nutrient_pump_on_duration == 0 {
            return;
        }
        if deps.scheduler.has_job(START_JOB).unwrap_or(false) || deps.scheduler.has_job(STOP_JOB).unwrap_or(false) {
            return;
        }
        tracing::warn!("nutrient loop had no pending job, reinitializing schedule");
        self.reschedule_start(deps);
    }
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

    fn actuator() -> (tempfile::TempDir, ActuatorFacade) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.0\nNutrientPumpB = 0.1\nNutrientPumpC = 0.2\nMixingPump = 0.3\n")
            .unwrap();
        (dir, ActuatorFacade::new(RelayAssignments::new(Config::new(path)), Box::new(MemoryRelayBackend::new())))
    }

    fn settings() -> Settings {
        let (_dir, cfg) = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("device.conf");
            std::fs::File::create(&path)
                .unwrap()
                .write_all(b"[EC]\nec_target = 1.0, 1.0\nec_deadband = 0.1, 0.1\nec_min = 0, 0\nec_max = 99, 99\n[NutrientPump]\nnutrient_pump_on_duration = 00:00:05, 00:00:05\nnutrient_pump_wait_duration = 00:05:00, 00:05:00\nabc_ratio = \"1:1:0\", \"1:1:0\"\n")
                .unwrap();
            (dir, Config::new(path))
        };
        Settings::load(&cfg)
    }

    fn deps_harness() -> (tempfile::TempDir, ActuatorFacade, Settings, MemoryFileStore, FakeClock, MemoryAuditSink, PumpTimeoutMonitor, StuckSensorDetector, Scheduler) {
        let (dir, actuator) = actuator();
        let settings = settings();
        let store = MemoryFileStore::new();
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let audit = MemoryAuditSink::new();
        let pump_monitor = PumpTimeoutMonitor::new();
        let stuck_detector = StuckSensorDetector::new();
        let scheduler = Scheduler::in_memory();
        (dir, actuator, settings, store, clock, audit, pump_monitor, stuck_detector, scheduler)
    }

    #[test]
    fn doses_below_lower_bound_with_configured_ratio() {
        let (_dir, actuator, settings, store, clock, audit, pump_monitor, stuck_detector, scheduler) = deps_harness();
        snapshot::write_reading(&store, "snapshot.json", SensorKind::Ec, LOCATION, crate::sensors::Reading { value: Some(0.85), timestamp: clock.now() }, clock.now()).unwrap();

        let deps = Deps {
            actuator: &actuator,
            scheduler: &scheduler,
            file_store: &store,
            clock: &clock,
            audit: &audit,
            pump_monitor: &pump_monitor,
            stuck_detector: &stuck_detector,
            snapshot_path: "snapshot.json",
            runtime_tracker_path: "runtime.json",
            emergency_flag_path: "emergency.flag",
            settings: &settings,
        };

        let loop_ = NutrientLoop::new();
        loop_.on_start(&deps);

        assert!(actuator.get_relay_state("NutrientPumpA").unwrap().is_on());
        assert!(actuator.get_relay_state("NutrientPumpB").unwrap().is_on());
        assert!(!actuator.get_relay_state("NutrientPumpC").unwrap().is_on());
        assert!(scheduler.has_job(STOP_JOB).unwrap());
        assert_eq!(audit.events().len(), 1);
        assert_eq!(audit.events()[0].action, "nutrient_start");
    }

    #[test]
    fn skips_and_clears_hysteresis_once_target_reached() {
        let (_dir, actuator, settings, store, clock, audit, pump_monitor, stuck_detector, scheduler) = deps_harness();
        snapshot::write_reading(&store, "snapshot.json", SensorKind::Ec, LOCATION, crate::sensors::Reading { value: Some(1.02), timestamp: clock.now() }, clock.now()).unwrap();

        let deps = Deps {
            actuator: &actuator,
            scheduler: &scheduler,
            file_store: &store,
            clock: &clock,
            audit: &audit,
            pump_monitor: &pump_monitor,
            stuck_detector: &stuck_detector,
            snapshot_path: "snapshot.json",
            runtime_tracker_path: "runtime.json",
            emergency_flag_path: "emergency.flag",
            settings: &settings,
        };

        let loop_ = NutrientLoop::new();
        loop_.on_start(&deps);

        assert!(!actuator.get_relay_state("NutrientPumpA").unwrap().is_on());
        assert!(!loop_.dosing_active.load(Ordering::SeqCst));
        assert!(scheduler.has_job(START_JOB).unwrap());
    }

    #[test]
    fn emergency_latch_blocks_dosing_even_with_low_ec() {
        let (_dir, actuator, settings, store, clock, audit, pump_monitor, stuck_detector, scheduler) = deps_harness();
        snapshot::write_reading(&store, "snapshot.json", SensorKind::Ec, LOCATION, crate::sensors::Reading { value: Some(0.1), timestamp: clock.now() }, clock.now()).unwrap();
        store.write_atomic("emergency.flag", b"Emergency shutdown: test\n").unwrap();

        let deps = Deps {
            actuator: &actuator,
            scheduler: &scheduler,
            file_store: &store,
            clock: &clock,
            audit: &audit,
            pump_monitor: &pump_monitor,
            stuck_detector: &stuck_detector,
            snapshot_path: "snapshot.json",
            runtime_tracker_path: "runtime.json",
            emergency_flag_path: "emergency.flag",
            settings: &settings,
        };

        NutrientLoop::new().on_start(&deps);
        assert!(!actuator.get_relay_state("NutrientPumpA").unwrap().is_on());
    }

    #[test]
    fn stop_turns_pumps_off_and_records_runtime() {
        let (_dir, actuator, settings, store, clock, audit, pump_monitor, stuck_detector, scheduler) = deps_harness();
        actuator.set_nutrient_pumps(true).unwrap();

        let deps = Deps {
            actuator: &actuator,
            scheduler: &scheduler,
            file_store: &store,
            clock: &clock,
            audit: &audit,
            pump_monitor: &pump_monitor,
            stuck_detector: &stuck_detector,
            snapshot_path: "snapshot.json",
            runtime_tracker_path: "runtime.json",
            emergency_flag_path: "emergency.flag",
            settings: &settings,
        };

        NutrientLoop::new().on_stop(&deps);

        assert!(!actuator.get_relay_state("NutrientPumpA").unwrap().is_on());
        assert_eq!(deps.runtime_tracker().today_total_runtime(clock.now()), 5);
        assert!(scheduler.has_job(START_JOB).unwrap());
    }
}
