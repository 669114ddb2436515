//! Emergency-shutdown latch. The flag file's presence
//! *is* the truth — there is no separate in-memory flag that could drift
//! from disk, so a restart after a crash still honors a latched shutdown.

use chrono::{DateTime, Utc};

use crate::actuator::ActuatorFacade;
use crate::audit::{AuditEvent, AuditSink, EventSource, EventType};
use crate::ports::FileStore;
use crate::safety::DOSING_PUMPS;

/// Stops every dosing pump, writes the emergency flag, and files an audit
/// event. `actuator` is optional so this can be exercised in tests (and,
/// per the ported original, so a caller with no relay wiring yet can still
/// latch the flag) without a live relay backend.
pub fn trigger_emergency_shutdown(
    store: &dyn FileStore,
    flag_path: &str,
    reason: &str,
    actuator: Option<&ActuatorFacade>,
    audit: &dyn AuditSink,
    now: DateTime<Utc>,
) {
    tracing::error!(reason, "emergency shutdown triggered");

    if let Some(actuator) = actuator {
        for pump in DOSING_PUMPS {
            if let Err(err) = actuator.set_relay(pump, false) {
                tracing::error!(pump, error = %err, "failed to stop pump during emergency shutdown");
            }
        }
    }

    let contents = format!("Emergency shutdown: {reason}\n");
    if let Err(err) = store.write_atomic(flag_path, contents.as_bytes()) {
        tracing::error!(error = %err, "failed to persist emergency flag");
    }

    tracing::error!(flag_path, "emergency flag created, manual intervention required");

    audit.record(AuditEvent::new(EventType::Alarm, "emergency_shutdown", EventSource::Autonomous, now).with_details(reason.to_string()));
}

pub fn is_emergency_active(store: &dyn FileStore, flag_path: &str) -> bool {
    store.exists(flag_path)
}

/// Manual operator API — clears the latch so automatic control
/// loops resume. Never called automatically.
pub fn clear_emergency_shutdown(store: &dyn FileStore, flag_path: &str) {
    if store.exists(flag_path) {
        let _ = store.delete(flag_path);
        tracing::info!("emergency shutdown flag cleared manually");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ports::MemoryFileStore;

    const FLAG: &str = "data/emergency.flag";

    #[test]
    fn trigger_sets_flag_and_records_audit_event() {
        let store = MemoryFileStore::new();
        let audit = MemoryAuditSink::new();
        assert!(!is_emergency_active(&store, FLAG));

        trigger_emergency_shutdown(&store, FLAG, "pump_timeout_NutrientPumpA_35.0s", None, &audit, Utc::now());

        assert!(is_emergency_active(&store, FLAG));
        assert_eq!(audit.events().len(), 1);
        assert_eq!(audit.events()[0].event_type, EventType::Alarm);
    }

    #[test]
    fn clear_removes_flag_and_is_idempotent() {
        let store = MemoryFileStore::new();
        let audit = MemoryAuditSink::new();
        trigger_emergency_shutdown(&store, FLAG, "manual test", None, &audit, Utc::now());
        assert!(is_emergency_active(&store, FLAG));

        clear_emergency_shutdown(&store, FLAG);
        assert!(!is_emergency_active(&store, FLAG));

        clear_emergency_shutdown(&store, FLAG);
        assert!(!is_emergency_active(&store, FLAG));
    }
}
