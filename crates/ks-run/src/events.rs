// events.rs — Event model and notification dispatch.
//
// Keystone emits an event whenever a run reaches a point a human may need
// to act on: a gate opens or is resolved, the run halts or pauses, a stage
// is entered, the run closes. Notification sinks (a JSONL log, a chat
// bridge, a pager) subscribe to these events.
//
// Sinks observe; they cannot change the run. A failing sink is logged and
// skipped, it never fails the transition that produced the event.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ks_policy::{GateDecision, HaltSource, RunOutcome, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunError;

/// Events emitted at key points of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum KsEvent {
    /// A gated signal is waiting for a human decision.
    GateOpened {
        run_id: Uuid,
        signal_id: Uuid,
        signal_type: String,
        stage_from: Stage,
        stage_to: Stage,
        timestamp: DateTime<Utc>,
    },

    GateResolved {
        run_id: Uuid,
        signal_id: Uuid,
        decision: GateDecision,
        identity: String,
        timestamp: DateTime<Utc>,
    },

    HaltRaised {
        run_id: Uuid,
        source: HaltSource,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Scope drift was reported; the run waits for a drift decision.
    RunPaused {
        run_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    StageAdvanced {
        run_id: Uuid,
        from: Stage,
        to: Stage,
        timestamp: DateTime<Utc>,
    },

    RunClosed {
        run_id: Uuid,
        outcome: RunOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Free-form notice raised through `signal.notify`.
    Notice {
        run_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl KsEvent {
    pub fn event_type(&self) -> &str {
        match self {
            KsEvent::GateOpened { .. } => "gate_opened",
            KsEvent::GateResolved { .. } => "gate_resolved",
            KsEvent::HaltRaised { .. } => "halt_raised",
            KsEvent::RunPaused { .. } => "run_paused",
            KsEvent::StageAdvanced { .. } => "stage_advanced",
            KsEvent::RunClosed { .. } => "run_closed",
            KsEvent::Notice { .. } => "notice",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            KsEvent::GateOpened { run_id, .. }
            | KsEvent::GateResolved { run_id, .. }
            | KsEvent::HaltRaised { run_id, .. }
            | KsEvent::RunPaused { run_id, .. }
            | KsEvent::StageAdvanced { run_id, .. }
            | KsEvent::RunClosed { run_id, .. }
            | KsEvent::Notice { run_id, .. } => *run_id,
        }
    }

    pub fn halt_raised(run_id: Uuid, source: HaltSource, reason: &str) -> Self {
        KsEvent::HaltRaised {
            run_id,
            source,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage_advanced(run_id: Uuid, from: Stage, to: Stage) -> Self {
        KsEvent::StageAdvanced {
            run_id,
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}

/// Receives run events.
pub trait NotificationSink: Send + Sync {
    /// Handle an event. Errors are logged but don't stop the run.
    fn send(&self, event: &KsEvent) -> Result<(), RunError>;
}

/// Appends events as JSONL to a file.
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl NotificationSink for LogSink {
    fn send(&self, event: &KsEvent) -> Result<(), RunError> {
        let io_err = |path: &Path, source| RunError::IoError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

/// Dispatches events to every registered sink.
#[derive(Default)]
pub struct EventDispatcher {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Send an event to all sinks; a failing sink does not stop the others.
    pub fn dispatch(&self, event: &KsEvent) {
        tracing::info!(event = event.event_type(), run_id = %event.run_id(), "run event");
        for sink in &self.sinks {
            if let Err(e) = sink.send(event) {
                tracing::warn!(event = event.event_type(), error = %e, "notification sink error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl NotificationSink for Recorder {
        fn send(&self, event: &KsEvent) -> Result<(), RunError> {
            self.0.lock().unwrap().push(event.event_type().to_string());
            Ok(())
        }
    }

    struct Failing;

    impl NotificationSink for Failing {
        fn send(&self, _event: &KsEvent) -> Result<(), RunError> {
            Err(RunError::TaskFailed("sink down".into()))
        }
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = KsEvent::stage_advanced(Uuid::new_v4(), Stage::Intake, Stage::Framing);
        let json = serde_json::to_string(&event).unwrap();
        let restored: KsEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.event_type(), "stage_advanced");
        assert!(json.contains("\"event_type\":\"stage_advanced\""));
    }

    #[test]
    fn log_sink_appends_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("events.jsonl");
        let sink = LogSink::new(&path);
        let run_id = Uuid::new_v4();

        sink.send(&KsEvent::halt_raised(run_id, HaltSource::Manual, "stop"))
            .unwrap();
        sink.send(&KsEvent::stage_advanced(run_id, Stage::Intake, Stage::Framing))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("halt_raised"));
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_sink(Box::new(Failing));
        dispatcher.add_sink(Box::new(Recorder(seen.clone())));

        dispatcher.dispatch(&KsEvent::RunClosed {
            run_id: Uuid::new_v4(),
            outcome: RunOutcome::Completed,
            timestamp: Utc::now(),
        });
        assert_eq!(seen.lock().unwrap().as_slice(), ["run_closed"]);
    }
}
