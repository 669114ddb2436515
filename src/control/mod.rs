//! Per-actuator control loops. Each module is a small
//! state machine triggered by the scheduler, never by polling another
//! loop — the only coupling between loops is the nutrient/pH → mixing
//! nudge (§4.4, §9), implemented as a scheduled job, never a direct call
//! into another loop's state.

pub mod mixing;
pub mod nutrient;
pub mod ph;
pub mod sprinkler;
pub mod water_level;

use chrono::{DateTime, Utc};

use crate::actuator::ActuatorFacade;
use crate::audit::AuditSink;
use crate::config::Settings;
use crate::ports::{Clock, FileStore};
use crate::safety::pump_timeout::PumpTimeoutMonitor;
use crate::safety::runtime_tracker::RuntimeTracker;
use crate::safety::stuck_sensor::StuckSensorDetector;
use crate::scheduler::Scheduler;
use crate::sensors::snapshot::SnapshotView;

/// Everything a control loop needs to evaluate one trigger. Bundled so
/// `app.rs` can construct it once per tick rather than threading a dozen
/// parameters through every call. Every collaborator is an explicitly
/// owned value, never a singleton.
pub struct Deps<'a> {
    pub actuator: &'a ActuatorFacade,
    pub scheduler: &'a Scheduler,
    pub file_store: &'a dyn FileStore,
    pub clock: &'a dyn Clock,
    pub audit: &'a dyn AuditSink,
    pub pump_monitor: &'a PumpTimeoutMonitor,
    pub stuck_detector: &'a StuckSensorDetector,
    pub snapshot_path: &'a str,
    pub runtime_tracker_path: &'a str,
    pub emergency_flag_path: &'a str,
    pub settings: &'a Settings,
}

impl<'a> Deps<'a> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn snapshot(&self) -> SnapshotView {
        crate::sensors::snapshot::read(self.file_store, self.snapshot_path)
    }

    pub fn runtime_tracker(&self) -> RuntimeTracker<'_> {
        RuntimeTracker::new(self.file_store, self.runtime_tracker_path)
    }

    pub fn emergency_active(&self) -> bool {
        crate::safety::emergency::is_emergency_active(self.file_store, self.emergency_flag_path)
    }

    pub fn trigger_emergency(&self, reason: &str) {
        crate::safety::emergency::trigger_emergency_shutdown(self.file_store, self.emergency_flag_path, reason, Some(self.actuator), self.audit, self.now());
    }
}

pub const DOSING_PUMP_HARD_MAX_SECONDS: i64 = 30;
