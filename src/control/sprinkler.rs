//! Sprinkler loop.
//! Unlike the dosing loops this one isn't driven by a sensor reading at
//! all — it's a plain recurring on/off timer, gated by a live config check
//! on every fire so toggling `sprinkler_scheduling_enabled` takes effect on
//! the very next scheduled event rather than waiting for a reload.

use chrono::Duration;

use crate::control::Deps;
use crate::scheduler::JobKind;

const START_JOB: &str = "sprinkler_start";
const STOP_JOB: &str = "sprinkler_stop";

/// Startup policy: disabled means "ensure off and do nothing
/// else"; `sprinkler_on_at_startup` means "on now, schedule the stop";
/// otherwise schedule the first start at `+wait_duration`.
pub fn on_boot(deps: &Deps) {
    if !deps.settings.sprinkler_scheduling_enabled {
        if let Err(err) = deps.actuator.set_sprinklers(false) {
            tracing::error!(error = %err, "failed to force sprinklers off while scheduling disabled");
        }
        return;
    }

    if deps.settings.sprinkler_on_at_startup {
        turn_on(deps);
    } else {
        reschedule_start(deps);
    }
}

pub fn on_start(deps: &Deps) {
    if !deps.settings.sprinkler_scheduling_enabled {
        tracing::info!("sprinkler_start skipped: scheduling disabled");
        if let Err(err) = deps.actuator.set_sprinklers(false) {
            tracing::error!(error = %err, "failed to force sprinklers off while scheduling disabled");
        }
        return;
    }
    turn_on(deps);
}

fn turn_on(deps: &Deps) {
    if let Err(err) = deps.actuator.set_sprinklers(true) {
        tracing::error!(error = %err, "failed to turn sprinklers on");
        return;
    }

    deps.audit.record(crate::audit::AuditEvent::new(
        crate::audit::EventType::Irrigation,
        "sprinkler_start",
        crate::audit::EventSource::Scheduled,
        deps.now(),
    ));

    if deps.settings.sprinkler_on_duration == 0 {
        return;
    }

    let stop_at = deps.now() + Duration::seconds(deps.settings.sprinkler_on_duration as i64);
    if let Err(err) = deps.scheduler.add_job(STOP_JOB, stop_at, JobKind::Stop) {
        tracing::error!(error = %err, "failed to schedule sprinkler_stop, forcing off immediately");
        force_off(deps);
    }
}

pub fn on_stop(deps: &Deps) {
    force_off(deps);
    reschedule_start(deps);
}

fn force_off(deps: &Deps) {
    if let Err(err) = deps.actuator.set_sprinklers(false) {
        tracing::error!(error = %err, "failed to turn sprinklers off");
    }
    deps.audit.record(crate::audit::AuditEvent::new(
        crate::audit::EventType::Irrigation,
        "sprinkler_stop",
        crate::audit::EventSource::Scheduled,
        deps.now(),
    ));
}

/// Schedules the next `sprinkler_start`, honoring the `99:99:99` sentinel:
/// `Settings::sprinkler_wait_duration()` returns `None`
/// when scheduling should simply stop, leaving the sprinklers off until an
/// operator or config change restarts the cycle.
fn reschedule_start(deps: &Deps) {
    if !deps.settings.sprinkler_scheduling_enabled {
        return;
    }
    let Some(wait) = deps.settings.sprinkler_wait_duration() else {
        return;
    };
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) {
        return;
    }
    let next = deps.now() + Duration::seconds(wait as i64);
    if let Err(err) = deps.scheduler.add_job(START_JOB, next, JobKind::Start) {
        tracing::error!(error = %err, "failed to reschedule sprinkler_start");
    }
}

/// Self-heal hook for the scheduler health check.
pub fn ensure_scheduled(deps: &Deps) {
    if !deps.settings.sprinkler_scheduling_enabled || deps.settings.sprinkler_on_duration == 0 {
        return;
    }
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) || deps.scheduler.has_job(STOP_JOB).unwrap_or(false) {
        return;
    }
    tracing::warn!("sprinkler loop had no pending job, reinitializing schedule");
    reschedule_start(deps);
}
