//! Audit trail. Batch upload to
//! an external compliance backend is out of scope — that's
//! `AuditSink::record`'s caller's problem; this module only guarantees an
//! at-least-once local append.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserCommand,
    Override,
    ConfigChange,
    Dosing,
    Irrigation,
    Climate,
    PhaseTransition,
    Alarm,
    ModeChange,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Autonomous,
    Manual,
    Scheduled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub action: String,
    pub resource: Option<String>,
    pub value: Option<serde_json::Value>,
    pub previous_value: Option<serde_json::Value>,
    pub source: EventSource,
    pub status: Option<String>,
    pub details: Option<String>,
    pub grow_cycle_id: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: EventType, action: impl Into<String>, source: EventSource, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            event_type,
            action: action.into(),
            resource: None,
            value: None,
            previous_value: None,
            source,
            status: None,
            details: None,
            grow_cycle_id: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_previous_value(mut self, value: serde_json::Value) -> Self {
        self.previous_value = Some(value);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Where audit events ultimately land. A real deployment's sink also
/// uploads to a compliance backend (out of scope here); `record` only has
/// to guarantee the event survives a process restart.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Debounced wrapper: suppresses repeat events sharing a `debounce_key`
/// within `debounce_seconds` of each other, so a control loop ticking
/// every few seconds doesn't flood the trail with identical entries.
pub struct Debounced<'a> {
    last_emitted: Mutex<HashMap<String, DateTime<Utc>>>,
    inner: &'a dyn AuditSink,
}

impl<'a> Debounced<'a> {
    pub fn new(inner: &'a dyn AuditSink) -> Self {
        Self { last_emitted: Mutex::new(HashMap::new()), inner }
    }

    pub fn record_debounced(&self, event: AuditEvent, debounce_key: &str, debounce: chrono::Duration, now: DateTime<Utc>) {
        let mut last = self.last_emitted.lock().unwrap();
        if let Some(previous) = last.get(debounce_key) {
            if now.signed_duration_since(*previous) < debounce {
                return;
            }
        }
        last.insert(debounce_key.to_string(), now);
        drop(last);
        self.inner.record(event);
    }
}

/// Append-only JSON-lines file sink: one JSON object per line, so a
/// truncated last line from a crash never corrupts earlier entries.
pub struct FileAuditSink {
    path: std::path::PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize audit event");
                return;
            }
        };

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(err) = result {
            tracing::error!(error = %err, path = %self.path.display(), "failed to append audit event");
        }
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileAuditSink::new(&path);

        sink.record(AuditEvent::new(EventType::Dosing, "nutrient_start", EventSource::Autonomous, Utc::now()).with_resource("NutrientPumpA"));
        sink.record(AuditEvent::new(EventType::Dosing, "nutrient_stop", EventSource::Autonomous, Utc::now()).with_resource("NutrientPumpA"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().contains("nutrient_start"));
    }

    #[test]
    fn debounce_suppresses_repeat_within_window() {
        let sink = MemoryAuditSink::new();
        let debounced = Debounced::new(&sink);
        let t0 = Utc::now();

        debounced.record_debounced(AuditEvent::new(EventType::System, "tick", EventSource::Autonomous, t0), "tick", chrono::Duration::seconds(10), t0);
        debounced.record_debounced(AuditEvent::new(EventType::System, "tick", EventSource::Autonomous, t0), "tick", chrono::Duration::seconds(10), t0 + chrono::Duration::seconds(5));
        assert_eq!(sink.events().len(), 1);

        debounced.record_debounced(AuditEvent::new(EventType::System, "tick", EventSource::Autonomous, t0), "tick", chrono::Duration::seconds(10), t0 + chrono::Duration::seconds(11));
        assert_eq!(sink.events().len(), 2);
    }
}
