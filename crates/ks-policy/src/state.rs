// state.rs — Governance state: everything the permission machine needs to
// know about a run to rule on a request.
//
// This struct is never edited directly by callers. The ledger folds its
// entries into it, so the ledger stays the single authority for "where is
// this run right now".

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::role::RoleTag;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// All stage work.
    #[default]
    Standard,
    /// Reads, validation and metrics only.
    Review,
    /// Corrections during a scope micro-adjustment, then replay-forward.
    Replay,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Standard => write!(f, "standard"),
            ExecutionMode::Review => write!(f, "review"),
            ExecutionMode::Replay => write!(f, "replay"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ExecutionMode::Standard),
            "review" => Ok(ExecutionMode::Review),
            "replay" => Ok(ExecutionMode::Replay),
            other => Err(PolicyError::UnknownMode(other.to_string())),
        }
    }
}

/// The human's answer to a scope-drift pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftChoice {
    /// Drop the out-of-scope material.
    Exclude,
    /// Widen the scope to include it. Refused once the baseline is frozen.
    ExpandScope,
    /// Keep the scope, clarify the boundary.
    Clarify,
}

impl std::str::FromStr for DriftChoice {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude" => Ok(DriftChoice::Exclude),
            "expand_scope" | "expand-scope" => Ok(DriftChoice::ExpandScope),
            "clarify" => Ok(DriftChoice::Clarify),
            other => Err(PolicyError::UnknownChoice(other.to_string())),
        }
    }
}

/// The human's answer to a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltChoice {
    Resume,
    Abandon,
}

impl std::str::FromStr for HaltChoice {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(HaltChoice::Resume),
            "abandon" => Ok(HaltChoice::Abandon),
            other => Err(PolicyError::UnknownChoice(other.to_string())),
        }
    }
}

/// Approve or reject a gated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approve,
    Reject,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Approve => write!(f, "approve"),
            GateDecision::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for GateDecision {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(GateDecision::Approve),
            "reject" => Ok(GateDecision::Reject),
            other => Err(PolicyError::UnknownChoice(other.to_string())),
        }
    }
}

/// A gated signal, pending or approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRef {
    pub signal_id: Uuid,
    pub signal_type: String,
    pub stage_from: Stage,
    pub stage_to: Stage,
}

/// What raised a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltSource {
    Metric,
    Manual,
    Integrity,
}

impl fmt::Display for HaltSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltSource::Metric => write!(f, "metric"),
            HaltSource::Manual => write!(f, "manual"),
            HaltSource::Integrity => write!(f, "integrity"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltState {
    pub source: HaltSource,
    pub reason: String,
    /// Ledger sequence number of the entry that raised the halt.
    pub raised_at_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseState {
    pub reason: String,
    pub raised_at_seq: u64,
}

/// An in-progress scope micro-adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    /// Stage the run was at when the adjustment started.
    pub origin: Stage,
    /// Stage jumped back to.
    pub target: Stage,
    /// Mode to restore once replay reaches the origin again.
    pub prior_mode: ExecutionMode,
    /// A correction artifact has been produced at the target stage.
    pub corrected: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Abandoned,
}

/// Last emitted signal, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMark {
    pub signal_id: Uuid,
    pub signal_type: String,
    pub status: String,
}

/// Folded governance state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceState {
    pub run_id: Uuid,
    pub started: bool,
    pub stage: Stage,
    pub role: RoleTag,
    pub mode: ExecutionMode,
    pub pending_gate: Option<GateRef>,
    pub approved_gate: Option<GateRef>,
    pub halt: Option<HaltState>,
    pub pause: Option<PauseState>,
    pub baseline_frozen: bool,
    pub adjustment: Option<Adjustment>,
    pub closed: bool,
    pub outcome: Option<RunOutcome>,
    pub last_signal: Option<SignalMark>,
    /// Consecutive warning-band metric snapshots. Informational.
    pub warning_streak: u32,
    /// Number of ledger entries folded in.
    pub entries: u64,
}

impl GovernanceState {
    /// State of a run before its first ledger entry.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started: false,
            stage: Stage::Intake,
            role: RoleTag::Analyst,
            mode: ExecutionMode::Standard,
            pending_gate: None,
            approved_gate: None,
            halt: None,
            pause: None,
            baseline_frozen: false,
            adjustment: None,
            closed: false,
            outcome: None,
            last_signal: None,
            warning_streak: 0,
            entries: 0,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    pub fn gate_pending(&self) -> bool {
        self.pending_gate.is_some()
    }

    /// Short status word used in projections and run listings.
    pub fn status(&self) -> &'static str {
        match (self.closed, self.outcome) {
            (true, Some(RunOutcome::Abandoned)) => "abandoned",
            (true, _) => "closed",
            _ if self.halt.is_some() => "halted",
            _ if self.pause.is_some() => "paused",
            _ if self.pending_gate.is_some() => "gate_pending",
            _ => "active",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_active_at_intake() {
        let state = GovernanceState::new(Uuid::new_v4());
        assert_eq!(state.stage, Stage::Intake);
        assert_eq!(state.role, RoleTag::Analyst);
        assert_eq!(state.mode, ExecutionMode::Standard);
        assert_eq!(state.status(), "active");
    }

    #[test]
    fn status_precedence() {
        let mut state = GovernanceState::new(Uuid::new_v4());
        state.pause = Some(PauseState {
            reason: "drift".into(),
            raised_at_seq: 3,
        });
        assert_eq!(state.status(), "paused");
        state.halt = Some(HaltState {
            source: HaltSource::Manual,
            reason: "stop".into(),
            raised_at_seq: 4,
        });
        assert_eq!(state.status(), "halted");
        state.closed = true;
        state.outcome = Some(RunOutcome::Abandoned);
        assert_eq!(state.status(), "abandoned");
    }

    #[test]
    fn choices_parse() {
        assert_eq!("expand-scope".parse::<DriftChoice>().unwrap(), DriftChoice::ExpandScope);
        assert_eq!("abandon".parse::<HaltChoice>().unwrap(), HaltChoice::Abandon);
        assert_eq!("reject".parse::<GateDecision>().unwrap(), GateDecision::Reject);
        assert!("maybe".parse::<GateDecision>().is_err());
        assert!("replay".parse::<ExecutionMode>().is_ok());
    }
}
