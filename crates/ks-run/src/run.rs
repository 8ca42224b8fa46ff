// run.rs — Run: the record of one governed analysis run.
//
// The run record is a summary for listings and the snapshot file. It is
// never the source of truth: stage, role, mode and status are copied from
// the ledger's folded governance state after every committed transition.
//
// Status values:
//   active → gate_pending → active → ... → closed
//   (paused and halted are waiting states; abandoned ends a halted run)

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ks_graph::ArtifactId;
use ks_policy::{ExecutionMode, GovernanceState, RoleTag, RunOutcome, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a run, derived from its governance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    GatePending,
    Paused,
    Halted,
    Closed,
    Abandoned,
}

impl RunStatus {
    pub fn from_state(state: &GovernanceState) -> Self {
        match (state.closed, state.outcome) {
            (true, Some(RunOutcome::Abandoned)) => RunStatus::Abandoned,
            (true, _) => RunStatus::Closed,
            _ if state.halt.is_some() => RunStatus::Halted,
            _ if state.pause.is_some() => RunStatus::Paused,
            _ if state.pending_gate.is_some() => RunStatus::GatePending,
            _ => RunStatus::Active,
        }
    }

    /// Closed and abandoned runs accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Closed | RunStatus::Abandoned)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Active => write!(f, "active"),
            RunStatus::GatePending => write!(f, "gate_pending"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Halted => write!(f, "halted"),
            RunStatus::Closed => write!(f, "closed"),
            RunStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Summary record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage: Stage,
    pub role: RoleTag,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub artifact_ids: Vec<ArtifactId>,
    pub signal_ids: Vec<Uuid>,
    /// Where the ledger lives; `None` for in-memory runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub archived: bool,
}

impl Run {
    pub fn new(run_id: Uuid, title: impl Into<String>, ledger_path: Option<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            title: title.into(),
            created_at: now,
            updated_at: now,
            stage: Stage::Intake,
            role: RoleTag::Analyst,
            mode: ExecutionMode::Standard,
            status: RunStatus::Active,
            artifact_ids: Vec::new(),
            signal_ids: Vec::new(),
            ledger_path,
            archived: false,
        }
    }

    /// Copy committed state into the record.
    pub fn sync(
        &mut self,
        state: &GovernanceState,
        artifact_ids: Vec<ArtifactId>,
        signal_ids: Vec<Uuid>,
    ) {
        self.stage = state.stage;
        self.role = state.role;
        self.mode = state.mode;
        self.status = RunStatus::from_state(state);
        self.artifact_ids = artifact_ids;
        self.signal_ids = signal_ids;
        self.updated_at = Utc::now();
    }

    /// Eight-character id used in listings and the context line.
    pub fn short_id(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }
}
