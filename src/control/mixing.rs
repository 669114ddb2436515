//! Mixing loop. Two independent behaviors share this module:
//! a recurring mix cycle (`mixing_start`/`mixing_stop`, driven by
//! `mixing_duration`/`mixing_interval`) and the post-dose nudge the
//! nutrient and pH loops call into — the only cross-loop coupling in the
//! system, kept to a single function so neither loop ever reaches into the
//! other's state directly.

use chrono::Duration;

use crate::control::Deps;
use crate::scheduler::JobKind;

const START_JOB: &str = "mixing_start";
const STOP_JOB: &str = "mixing_stop";

pub fn on_boot(deps: &Deps) {
    start_cycle(deps);
}

pub fn on_start(deps: &Deps) {
    if deps.settings.mixing_duration == 0 {
        return;
    }
    start_cycle(deps);
}

fn start_cycle(deps: &Deps) {
    if deps.settings.mixing_duration == 0 {
        if let Err(err) = deps.actuator.set_mixing_pump(false) {
            tracing::error!(error = %err, "failed to stop mixing pump while disabled");
        }
        return;
    }

    if let Err(err) = deps.actuator.set_mixing_pump(true) {
        tracing::error!(error = %err, "failed to start mixing pump");
        return;
    }

    deps.audit.record(crate::audit::AuditEvent::new(
        crate::audit::EventType::Irrigation,
        "mixing_start",
        crate::audit::EventSource::Scheduled,
        deps.now(),
    ));

    let stop_at = deps.now() + Duration::seconds(deps.settings.mixing_duration as i64);
    if let Err(err) = deps.scheduler.add_job(STOP_JOB, stop_at, JobKind::Stop) {
        tracing::error!(error = %err, "failed to schedule mixing_stop, stopping pump immediately");
        stop_pump(deps);
    }
}

pub fn on_stop(deps: &Deps) {
    stop_pump(deps);
    reschedule_start(deps);
}

fn stop_pump(deps: &Deps) {
    if let Err(err) = deps.actuator.set_mixing_pump(false) {
        tracing::error!(error = %err, "failed to stop mixing pump");
    }
    deps.audit.record(crate::audit::AuditEvent::new(
        crate::audit::EventType::Irrigation,
        "mixing_stop",
        crate::audit::EventSource::Scheduled,
        deps.now(),
    ));
}

fn reschedule_start(deps: &Deps) {
    if deps.settings.mixing_interval == 0 {
        return;
    }
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) {
        return;
    }
    let next = deps.now() + Duration::seconds(deps.settings.mixing_interval as i64);
    if let Err(err) = deps.scheduler.add_job(START_JOB, next, JobKind::Start) {
        tracing::error!(error = %err, "failed to reschedule mixing_start");
    }
}

/// Extends (or starts) the mixing cycle so the pump stays on for at least
/// `trigger_mixing_duration` past a nutrient/pH dose completing.
/// Idempotent: re-nudging to the same or an earlier deadline than the
/// one already scheduled is a no-op.
pub fn nudge_after_dose(deps: &Deps) {
    if deps.settings.trigger_mixing_duration == 0 {
        return;
    }

    let deadline = deps.now() + Duration::seconds(deps.settings.trigger_mixing_duration as i64);
    let running = deps.actuator.get_relay_state("MixingPump").map(|s| s.is_on()).unwrap_or(false);

    if !running {
        if let Err(err) = deps.actuator.set_mixing_pump(true) {
            tracing::error!(error = %err, "failed to start mixing pump for post-dose nudge");
            return;
        }
        deps.audit.record(
            crate::audit::AuditEvent::new(crate::audit::EventType::Irrigation, "mixing_start", crate::audit::EventSource::Autonomous, deps.now())
                .with_details("post-dose nudge"),
        );
        if let Err(err) = deps.scheduler.add_job(STOP_JOB, deadline, JobKind::Stop) {
            tracing::error!(error = %err, "failed to schedule mixing_stop after post-dose nudge");
        }
        return;
    }

    match deps.scheduler.get_job(STOP_JOB) {
        Ok(Some(existing)) if existing.run_at >= deadline => {
            // Already scheduled to run at least as long as the nudge needs.
        }
        _ => {
            if let Err(err) = deps.scheduler.add_job(STOP_JOB, deadline, JobKind::Stop) {
                tracing::error!(error = %err, "failed to extend mixing_stop for post-dose nudge");
            }
        }
    }
}

/// Self-heal hook for the scheduler health check. Only touches
/// `mixing_start` — never restarts the pump itself, which a plain "job
/// missing" health check has no business doing.
pub fn ensure_scheduled(deps: &Deps) {
    if deps.settings.mixing_interval == 0 {
        return;
    }
    if deps.scheduler.has_job(START_JOB).unwrap_or(false) || deps.scheduler.has_job(STOP_JOB).unwrap_or(false) {
        return;
    }
    tracing::warn!("mixing loop had no pending job, reinitializing schedule");
    reschedule_start(deps);
}
