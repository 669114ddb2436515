//! Water-level loop: periodic refill evaluation plus operator-initiated
//! drains.
//!
//! Drain state is in-process, not persisted — losing an active drain on
//! crash is acceptable, since a restart defaults the drain back to inactive
//! — so [`WaterLevelLoop`] owns a
//! `Mutex<Option<DrainState>>` rather than reading it back from a file the
//! way the sensor snapshot and runtime tracker do.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::control::Deps;
use crate::scheduler::JobKind;
use crate::sensors::SensorKind;

const CHECK_JOB: &str = "water_level_check";
const CHECK_INTERVAL_SECONDS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainMode {
    Drain,
    Flush,
    FullDrain,
}

impl DrainMode {
    fn inhibits_refill(&self) -> bool {
        !matches!(self, DrainMode::Flush)
    }
}

#[derive(Clone, Debug)]
pub struct DrainState {
    pub mode: DrainMode,
    pub target_level: f64,
    pub started_at: DateTime<Utc>,
    pub max_duration: chrono::Duration,
    pub inhibit_refill: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DrainStatus {
    pub active: bool,
    pub mode: Option<DrainMode>,
    pub target_level: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    DrainAlreadyActive,
    FlushRequiresDuration,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DrainAlreadyActive => write!(f, "a drain is already active"),
            Error::FlushRequiresDuration => write!(f, "flush mode requires duration_seconds"),
        }
    }
}

impl std::error::Error for Error {}

/// Owns the in-process drain state. One instance lives for the life of the
/// process, shared through `app.rs`'s dependency injection like every other
/// safety/control collaborator.
#[derive(Default)]
pub struct WaterLevelLoop {
    drain: Mutex<Option<DrainState>>,
}

impl WaterLevelLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_boot(&self, deps: &Deps) {
        self.reschedule_check(deps);
    }

    /// Periodic refill/drain evaluation (the refill/drain decision table), fired
    /// by the `water_level_check` job.
    pub fn on_check(&self, deps: &Deps) {
        self.evaluate_drain(deps);

        if !deps.settings.water_level_control_enabled {
            self.reschedule_check(deps);
            return;
        }

        let drain_inhibits_refill = self.drain.lock().unwrap().as_ref().map(|d| d.inhibit_refill).unwrap_or(false);

        let reading = deps.snapshot().latest(SensorKind::WaterLevel);
        let Some(level) = reading.and_then(|r| r.value) else {
            self.reschedule_check(deps);
            return;
        };

        if level > deps.settings.water_level_max {
            if let Err(err) = deps.actuator.set_valve_outside_to_tank(false) {
                tracing::error!(error = %err, "failed to close inlet valve at high water level");
            }
            deps.audit.record(
                crate::audit::AuditEvent::new(crate::audit::EventType::Alarm, "water_above_maximum", crate::audit::EventSource::Autonomous, deps.now())
                    .with_value(serde_json::json!({ "level": level })),
            );
            self.reschedule_check(deps);
            return;
        }

        if drain_inhibits_refill {
            self.reschedule_check(deps);
            return;
        }

        if level < deps.settings.water_level_min {
            if let Err(err) = deps.actuator.set_valve_outside_to_tank(true) {
                tracing::error!(error = %err, "failed to open inlet valve for emergency refill");
            }
            deps.audit.record(
                crate::audit::AuditEvent::new(crate::audit::EventType::Alarm, "water_below_minimum", crate::audit::EventSource::Autonomous, deps.now())
                    .with_value(serde_json::json!({ "level": level })),
            );
        } else if level < deps.settings.water_level_target - deps.settings.water_level_deadband {
            if let Err(err) = deps.actuator.set_valve_outside_to_tank(true) {
                tracing::error!(error = %err, "failed to open inlet valve for refill");
            }
            deps.audit.record(crate::audit::AuditEvent::new(crate::audit::EventType::Irrigation, "refill_start", crate::audit::EventSource::Autonomous, deps.now()));
        }

        self.reschedule_check(deps);
    }

    fn reschedule_check(&self, deps: &Deps) {
        let next = deps.now() + chrono::Duration::seconds(CHECK_INTERVAL_SECONDS);
        if let Err(err) = deps.scheduler.add_job(CHECK_JOB, next, JobKind::Check) {
            tracing::error!(error = %err, "failed to reschedule water_level_check");
        }
    }

    /// Self-heal hook for the scheduler health check: the water
    /// level loop always needs a pending `water_level_check`, regardless of
    /// `water_level_control_enabled` (disabled mode still evaluates drains).
    pub fn ensure_scheduled(&self, deps: &Deps) {
        if deps.scheduler.has_job(CHECK_JOB).unwrap_or(false) {
            return;
        }
        tracing::warn!("water level loop had no pending check job, reinitializing schedule");
        self.reschedule_check(deps);
    }

    /// Starts an operator-initiated drain (the drain-operations
    /// rules). `target_level` and `drain_amount` are mutually resolved
    /// against the current snapshot reading; `full_drain` always targets 0
    /// regardless of either argument.
    pub fn start_drain(
        &self,
        deps: &Deps,
        target_level: Option<f64>,
        drain_amount: Option<f64>,
        duration_seconds: Option<i64>,
        mode: DrainMode,
    ) -> Result<(), Error> {
        if self.drain.lock().unwrap().is_some() {
            return Err(Error::DrainAlreadyActive);
        }
        if mode == DrainMode::Flush && duration_seconds.is_none() {
            return Err(Error::FlushRequiresDuration);
        }

        let effective_target = if mode == DrainMode::FullDrain {
            0.0
        } else {
            let requested = target_level.or_else(|| {
                drain_amount.and_then(|amount| deps.snapshot().latest(SensorKind::WaterLevel).and_then(|r| r.value).map(|current| current - amount))
            });
            requested.unwrap_or(deps.settings.tank_dump_safety_floor).max(deps.settings.tank_dump_safety_floor)
        };

        let max_duration = match duration_seconds {
            Some(seconds) => chrono::Duration::seconds(seconds.min(deps.settings.tank_dump_max_duration_seconds as i64)),
            None => chrono::Duration::seconds(deps.settings.tank_dump_max_duration_seconds as i64),
        };

        let state = DrainState {
            mode,
            target_level: effective_target,
            started_at: deps.now(),
            max_duration,
            inhibit_refill: mode.inhibits_refill(),
        };

        if let Err(err) = deps.actuator.set_valve_tank_to_outside(true) {
            tracing::error!(error = %err, "failed to open outlet valve for drain");
            return Ok(());
        }

        deps.audit.record(
            crate::audit::AuditEvent::new(crate::audit::EventType::Irrigation, "drain_start", crate::audit::EventSource::Manual, deps.now())
                .with_value(serde_json::json!({ "mode": format!("{mode:?}"), "target_level": effective_target })),
        );

        *self.drain.lock().unwrap() = Some(state);
        Ok(())
    }

    pub fn stop_drain(&self, deps: &Deps, reason: &str) {
        let had_drain = self.drain.lock().unwrap().take().is_some();
        if !had_drain {
            return;
        }
        if let Err(err) = deps.actuator.set_valve_tank_to_outside(false) {
            tracing::error!(error = %err, "failed to close outlet valve after drain");
        }
        deps.audit.record(
            crate::audit::AuditEvent::new(crate::audit::EventType::Irrigation, "drain_stop", crate::audit::EventSource::Manual, deps.now())
                .with_details(reason),
        );
    }

    pub fn get_drain_status(&self, now: DateTime<Utc>) -> DrainStatus {
        match self.drain.lock().unwrap().as_ref() {
            Some(state) => DrainStatus {
                active: true,
                mode: Some(state.mode),
                target_level: Some(state.target_level),
                started_at: Some(state.started_at),
                elapsed_seconds: Some(now.signed_duration_since(state.started_at).num_seconds()),
            },
            None => DrainStatus { active: false, mode: None, target_level: None, started_at: None, elapsed_seconds: None },
        }
    }

    /// Stops an active drain once level has reached target or the duration
    /// cap has elapsed. Runs at the top of every `on_check` so
    /// a drain never outlives its own evaluation cycle.
    fn evaluate_drain(&self, deps: &Deps) {
        let should_stop = {
            let guard = self.drain.lock().unwrap();
            let Some(state) = guard.as_ref() else { return };

            let elapsed = deps.now().signed_duration_since(state.started_at);
            let timed_out = elapsed >= state.max_duration;
            let reached_target = deps
                .snapshot()
                .latest(SensorKind::WaterLevel)
                .and_then(|r| r.value)
                .map(|level| level <= state.target_level)
                .unwrap_or(false);

            timed_out || reached_target
        };

        if should_stop {
            self.stop_drain(deps, "target reached or duration elapsed");
        }
    }
}
