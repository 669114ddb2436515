//! Wires every module into the running system. `Ripple` owns
//! every collaborator a control loop needs and builds a fresh [`Deps`] for
//! each tick — there is no global/static state anywhere in the core, one
//! struct bundling the whole controller rather than reaching
//! for module-level statics.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::actuator::ActuatorFacade;
use crate::audit::AuditSink;
use crate::config::{Config, Settings};
use crate::control::water_level::{DrainMode, DrainStatus};
use crate::control::{mixing, nutrient::NutrientLoop, ph, sprinkler, water_level::WaterLevelLoop, Deps};
use crate::errors::Error;
use crate::ports::{Clock, FileStore};
use crate::safety::pump_timeout::PumpTimeoutMonitor;
use crate::safety::stuck_sensor::StuckSensorDetector;
use crate::safety::validation::{is_valid_ec, is_valid_ph, is_valid_water_level};
use crate::scheduler::Scheduler;
use crate::sensors::{Sensor, SensorKind};

/// The main loop wakes every 10 seconds; the scheduler health
/// check only needs to run roughly every 60 seconds of those wakeups.
pub const MAIN_LOOP_TICK_SECONDS: i64 = 10;
const HEALTH_CHECK_INTERVAL_SECONDS: i64 = 60;

/// File paths the core reads/writes through [`FileStore`]. Bundled so `Ripple::new` takes one value
/// instead of four positional strings.
pub struct Paths {
    pub snapshot: String,
    pub runtime_tracker: String,
    pub emergency_flag: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self { snapshot: "data/sensor_snapshot.json".into(), runtime_tracker: "data/dosing_runtime.json".into(), emergency_flag: "data/emergency.flag".into() }
    }
}

/// A response shape for the operator command surface, mirroring
/// the `{status, message}` JSON the host's REST layer relays verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub ok: bool,
    pub message: Option<String>,
}

impl CommandResult {
    fn ok() -> Self {
        Self { ok: true, message: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { ok: false, message: Some(message.into()) }
    }
}

/// The running fertigation controller. One instance per process; every
/// collaborator it owns is injected, never looked up through a global.
pub struct Ripple {
    config: Config,
    actuator: ActuatorFacade,
    scheduler: Scheduler,
    file_store: Box<dyn FileStore>,
    clock: Box<dyn Clock>,
    audit: Box<dyn AuditSink>,
    pump_monitor: PumpTimeoutMonitor,
    stuck_detector: StuckSensorDetector,
    nutrient: NutrientLoop,
    water_level: WaterLevelLoop,
    sensors: Vec<Box<dyn Sensor>>,
    paths: Paths,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    last_settings: Mutex<Option<Settings>>,
}

impl Ripple {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        actuator: ActuatorFacade,
        scheduler: Scheduler,
        file_store: Box<dyn FileStore>,
        clock: Box<dyn Clock>,
        audit: Box<dyn AuditSink>,
        sensors: Vec<Box<dyn Sensor>>,
        paths: Paths,
    ) -> Self {
        Self {
            config,
            actuator,
            scheduler,
            file_store,
            clock,
            audit,
            pump_monitor: PumpTimeoutMonitor::new(),
            stuck_detector: StuckSensorDetector::new(),
            nutrient: NutrientLoop::new(),
            water_level: WaterLevelLoop::new(),
            sensors,
            paths,
            last_health_check: Mutex::new(None),
            last_settings: Mutex::new(None),
        }
    }

    fn deps<'a>(&'a self, settings: &'a Settings) -> Deps<'a> {
        Deps {
            actuator: &self.actuator,
            scheduler: &self.scheduler,
            file_store: self.file_store.as_ref(),
            clock: self.clock.as_ref(),
            audit: self.audit.as_ref(),
            pump_monitor: &self.pump_monitor,
            stuck_detector: &self.stuck_detector,
            snapshot_path: &self.paths.snapshot,
            runtime_tracker_path: &self.paths.runtime_tracker,
            emergency_flag_path: &self.paths.emergency_flag,
            settings,
        }
    }

    /// Runs every boot-time initialization in the fixed per-loop order:
    /// pH pumps forced off, mixing and sprinkler startup policy applied,
    /// the water-level check scheduled, and `PLUMBING` startup states set.
    pub fn boot(&self) {
        let settings = Settings::load(&self.config);
        let deps = self.deps(&settings);

        if deps.emergency_active() {
            tracing::warn!("starting with the emergency shutdown flag latched; dosing stays blocked until an operator clears it");
        }

        ph::on_boot(&deps);
        mixing::on_boot(&deps);
        sprinkler::on_boot(&deps);
        self.water_level.on_boot(&deps);
        self.apply_plumbing_startup_states(&deps);

        self.nutrient.ensure_scheduled(&deps);
        ph::ensure_scheduled(&deps);

        *self.last_settings.lock().unwrap() = Some(settings);
    }

    /// The 10-second main loop tick: poll sensors, drain due
    /// scheduler jobs, run the safety sweep, and periodically self-heal the
    /// schedule. Never drives a control decision directly — dispatch always
    /// goes through a scheduled job.
    pub fn tick(&self) {
        let settings = Settings::load(&self.config);
        let deps = self.deps(&settings);
        let now = deps.now();

        if !self.sensors.is_empty() {
            crate::sensors::scan_all(&self.sensors, self.file_store.as_ref(), &self.paths.snapshot, now);
        }

        match self.scheduler.tick(now) {
            Ok(jobs) => {
                for job in jobs {
                    self.dispatch_job(&job.id, &deps);
                }
            }
            Err(err) => tracing::error!(error = %err, "scheduler tick failed"),
        }

        self.safety_sweep(&deps);

        let mut last_health = self.last_health_check.lock().unwrap();
        let due = match *last_health {
            Some(previous) => now.signed_duration_since(previous) >= chrono::Duration::seconds(HEALTH_CHECK_INTERVAL_SECONDS),
            None => true,
        };
        if due {
            self.health_check(&deps);
            *last_health = Some(now);
        }
    }

    fn dispatch_job(&self, job_id: &str, deps: &Deps) {
        match job_id {
            "nutrient_start" => self.nutrient.on_start(deps),
            "nutrient_stop" => self.nutrient.on_stop(deps),
            "ph_start" => ph::on_start(deps),
            "ph_stop" => ph::on_stop(deps),
            "sprinkler_start" => sprinkler::on_start(deps),
            "sprinkler_stop" => sprinkler::on_stop(deps),
            "mixing_start" => mixing::on_start(deps),
            "mixing_stop" => mixing::on_stop(deps),
            "water_level_check" => self.water_level.on_check(deps),
            other => tracing::warn!(job_id = other, "no handler registered for this scheduled job id"),
        }
    }

    /// Pump-timeout, multi-sensor-failure, and stuck-sensor checks (spec
    /// §4.6), run every tick. Any of the three can latch the emergency flag.
    fn safety_sweep(&self, deps: &Deps) {
        for (pump_name, elapsed) in self.pump_monitor.timed_out_pumps(deps.now()) {
            let reason = format!("pump_timeout_{pump_name}_{}s", elapsed.num_seconds());
            deps.trigger_emergency(&reason);
        }

        let snapshot = deps.snapshot();
        let ec = snapshot.latest(SensorKind::Ec).and_then(|r| r.value);
        let ph_value = snapshot.latest(SensorKind::Ph).and_then(|r| r.value);
        let level = snapshot.latest(SensorKind::WaterLevel).and_then(|r| r.value);

        let invalid_count = [!is_valid_ec(ec), !is_valid_ph(ph_value), !is_valid_water_level(level)].into_iter().filter(|invalid| *invalid).count();
        if invalid_count >= 2 {
            deps.trigger_emergency("multi_sensor_failure");
            return;
        }

        if let Some(ec) = ec {
            if self.any_pump_active(&["NutrientPumpA", "NutrientPumpB", "NutrientPumpC"]) && self.stuck_detector.check_sensor_response("ec", ec, MAIN_LOOP_TICK_SECONDS).stuck {
                deps.trigger_emergency("stuck_sensor_ec");
            }
        }
        if let Some(ph_value) = ph_value {
            if self.any_pump_active(&["pHPlusPump", "pHMinusPump"]) && self.stuck_detector.check_sensor_response("ph", ph_value, MAIN_LOOP_TICK_SECONDS).stuck {
                deps.trigger_emergency("stuck_sensor_ph");
            }
        }
    }

    fn any_pump_active(&self, pumps: &[&str]) -> bool {
        pumps.iter().any(|pump| self.pump_monitor.is_active(pump))
    }

    /// Self-heal: every actuator with a positive `on_duration` must have at
    /// least one pending `_start`/`_stop` job. Each loop's own
    /// `ensure_scheduled` decides whether it's applicable and idempotent.
    fn health_check(&self, deps: &Deps) {
        self.nutrient.ensure_scheduled(deps);
        ph::ensure_scheduled(deps);
        sprinkler::ensure_scheduled(deps);
        mixing::ensure_scheduled(deps);
        self.water_level.ensure_scheduled(deps);
    }

    fn apply_plumbing_startup_states(&self, deps: &Deps) {
        let Ok(ini) = ini::Ini::load_from_file(self.config.path()) else { return };
        let Some(section) = ini.section(Some("PLUMBING")) else { return };
        let keys: Vec<String> = section.iter().map(|(k, _)| k.to_string()).collect();
        for key in keys {
            let Some(device) = key.strip_suffix("_on_at_startup") else { continue };
            let enabled = self.config.get_bool("PLUMBING", &key, false);
            if let Err(err) = deps.actuator.set_relay(device, enabled) {
                tracing::error!(error = %err, device, "failed to apply PLUMBING startup state");
            }
        }
    }

    /// Hot-reload entry point: processes every changed section
    /// in the fixed `RELOAD_ORDER`, each a standalone side effect. Any
    /// panic-worthy failure here would fall back to a full reboot-style
    /// reload in a production deployment; this implementation's side
    /// effects are all infallible actuator/scheduler calls that already
    /// log and continue on error individually.
    pub fn reload(&self, changed_sections: &HashSet<String>) {
        let previous = self.last_settings.lock().unwrap().clone();
        let settings = Settings::load(&self.config);
        let deps = self.deps(&settings);

        for section in crate::config::ordered_changed_sections(changed_sections) {
            match section {
                "Mixing" => self.reload_mixing(&deps),
                "NutrientPump" => self.reload_nutrient_pump(&deps),
                "Sprinkler" => self.reload_sprinkler(&deps, previous.as_ref()),
                "WaterLevel" => self.water_level.on_check(&deps),
                "EC" | "pH" => {} // Settings::load above already picked up the new targets.
                "PLUMBING" => self.apply_plumbing_startup_states(&deps),
                _ => {}
            }
        }

        *self.last_settings.lock().unwrap() = Some(settings);
    }

    fn reload_mixing(&self, deps: &Deps) {
        if let Err(err) = deps.actuator.set_mixing_pump(false) {
            tracing::error!(error = %err, "failed to stop mixing pump during reload");
        }
        let _ = deps.scheduler.remove_job("mixing_stop");
        if deps.settings.mixing_duration > 0 {
            mixing::on_boot(deps);
        }
    }

    fn reload_nutrient_pump(&self, deps: &Deps) {
        if deps.settings.nutrient_pump_on_duration == 0 {
            if let Err(err) = deps.actuator.set_nutrient_pumps(false) {
                tracing::error!(error = %err, "failed to stop nutrient pumps during reload");
            }
            let _ = deps.scheduler.remove_job("nutrient_start");
            let _ = deps.scheduler.remove_job("nutrient_stop");
        }
        if deps.settings.ph_pump_on_duration == 0 {
            if let Err(err) = deps.actuator.set_ph_plus_pump(false) {
                tracing::error!(error = %err, "failed to stop pH-up pump during reload");
            }
            if let Err(err) = deps.actuator.set_ph_minus_pump(false) {
                tracing::error!(error = %err, "failed to stop pH-down pump during reload");
            }
            let _ = deps.scheduler.remove_job("ph_start");
            let _ = deps.scheduler.remove_job("ph_stop");
        }
    }

    fn reload_sprinkler(&self, deps: &Deps, previous: Option<&Settings>) {
        if let Err(err) = deps.actuator.set_sprinklers(false) {
            tracing::error!(error = %err, "failed to stop sprinklers during reload");
        }

        if !deps.settings.sprinkler_scheduling_enabled {
            let _ = deps.scheduler.remove_job("sprinkler_start");
            let _ = deps.scheduler.remove_job("sprinkler_stop");
            return;
        }

        let on_increased = previous.map(|p| deps.settings.sprinkler_on_duration > p.sprinkler_on_duration).unwrap_or(false);
        let wait_decreased = match (previous.map(|p| p.sprinkler_wait_duration_raw.clone()), &deps.settings.sprinkler_wait_duration_raw) {
            (Some(old_raw), new_raw) => crate::config::duration::parse_duration(&old_raw) > crate::config::duration::parse_duration(new_raw),
            (None, _) => false,
        };

        let _ = deps.scheduler.remove_job("sprinkler_start");
        if on_increased || wait_decreased {
            sprinkler::on_start(deps);
        } else {
            sprinkler::ensure_scheduled(deps);
        }
    }

    // -- Operator command surface -------------------------------------------

    pub fn start_drain(&self, target_level: Option<f64>, drain_amount: Option<f64>, duration_seconds: Option<i64>, mode: DrainMode) -> CommandResult {
        let settings = Settings::load(&self.config);
        let deps = self.deps(&settings);
        match self.water_level.start_drain(&deps, target_level, drain_amount, duration_seconds, mode) {
            Ok(()) => CommandResult::ok(),
            Err(err) => CommandResult::err(err.to_string()),
        }
    }

    pub fn stop_drain(&self, reason: &str) -> CommandResult {
        let settings = Settings::load(&self.config);
        let deps = self.deps(&settings);
        self.water_level.stop_drain(&deps, reason);
        CommandResult::ok()
    }

    pub fn get_drain_status(&self) -> DrainStatus {
        self.water_level.get_drain_status(self.clock.now())
    }

    /// Rejected while a dosing pump is active (the critical-phase lock).
    pub fn set_relay(&self, device_name: &str, on: bool) -> Result<(), Error> {
        if !crate::safety::can_accept_new_command(&self.actuator) {
            return Err(Error::CriticalPhase);
        }
        self.actuator.set_relay(device_name, on)?;
        Ok(())
    }

    pub fn get_sensor_targets(&self) -> Settings {
        Settings::load(&self.config)
    }

    /// Updates one sensor kind's target/deadband/min/max, writing only the
    /// fields provided.
    pub fn update_sensor_targets(&self, kind: SensorKind, target: Option<f64>, deadband: Option<f64>, min: Option<f64>, max: Option<f64>) -> CommandResult {
        let section = match kind {
            SensorKind::Ec => "EC",
            SensorKind::Ph => "pH",
            SensorKind::WaterLevel => "WaterLevel",
            _ => return CommandResult::err("sensor kind has no configurable target"),
        };
        let prefix = match kind {
            SensorKind::Ec => "ec",
            SensorKind::Ph => "ph",
            SensorKind::WaterLevel => "water_level",
            _ => unreachable!(),
        };

        for (suffix, value) in [("target", target), ("deadband", deadband), ("min", min), ("max", max)] {
            let Some(value) = value else { continue };
            let key = format!("{prefix}_{suffix}");
            if let Err(err) = self.config.set_operational(section, &key, &value.to_string()) {
                return CommandResult::err(format!("failed to update {section}.{key}: {err}"));
            }
        }

        CommandResult::ok()
    }

    pub fn clear_emergency_shutdown(&self) -> CommandResult {
        crate::safety::emergency::clear_emergency_shutdown(self.file_store.as_ref(), &self.paths.emergency_flag);
        CommandResult::ok()
    }
}
