// action.rs — Operations, actors, and the request submitted for a verdict.
//
// Every state-changing (and every read) operation of a run has a dotted
// name like `artifact.produce` or `gate.resolve`. Role records grant and
// forbid operations with glob patterns over these names.

use std::fmt;

use ks_graph::ArtifactType;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::stage::Stage;
use crate::state::{DriftChoice, ExecutionMode};

/// The closed set of operations the permission machine rules on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "artifact.produce")]
    ArtifactProduce,
    #[serde(rename = "artifact.supersede")]
    ArtifactSupersede,
    #[serde(rename = "artifact.edit")]
    ArtifactEdit,
    #[serde(rename = "artifact.annotate")]
    ArtifactAnnotate,
    #[serde(rename = "graph.link")]
    GraphLink,
    #[serde(rename = "graph.read")]
    GraphRead,
    #[serde(rename = "ledger.read")]
    LedgerRead,
    #[serde(rename = "integrity.validate")]
    IntegrityValidate,
    #[serde(rename = "metric.evaluate")]
    MetricEvaluate,
    #[serde(rename = "signal.propose")]
    SignalPropose,
    #[serde(rename = "signal.notify")]
    SignalNotify,
    #[serde(rename = "gate.resolve")]
    GateResolve,
    #[serde(rename = "stage.advance")]
    StageAdvance,
    #[serde(rename = "stage.replay")]
    StageReplay,
    #[serde(rename = "baseline.freeze")]
    BaselineFreeze,
    #[serde(rename = "scope.change")]
    ScopeChange,
    #[serde(rename = "scope.adjust")]
    ScopeAdjust,
    #[serde(rename = "drift.report")]
    DriftReport,
    #[serde(rename = "drift.resolve")]
    DriftResolve,
    #[serde(rename = "halt.immediate")]
    HaltImmediate,
    #[serde(rename = "halt.resolve")]
    HaltResolve,
    #[serde(rename = "generation.request")]
    GenerationRequest,
    #[serde(rename = "role.switch")]
    RoleSwitch,
    #[serde(rename = "mode.set")]
    ModeSet,
    #[serde(rename = "run.close")]
    RunClose,
}

impl Operation {
    pub const ALL: [Operation; 25] = [
        Operation::ArtifactProduce,
        Operation::ArtifactSupersede,
        Operation::ArtifactEdit,
        Operation::ArtifactAnnotate,
        Operation::GraphLink,
        Operation::GraphRead,
        Operation::LedgerRead,
        Operation::IntegrityValidate,
        Operation::MetricEvaluate,
        Operation::SignalPropose,
        Operation::SignalNotify,
        Operation::GateResolve,
        Operation::StageAdvance,
        Operation::StageReplay,
        Operation::BaselineFreeze,
        Operation::ScopeChange,
        Operation::ScopeAdjust,
        Operation::DriftReport,
        Operation::DriftResolve,
        Operation::HaltImmediate,
        Operation::HaltResolve,
        Operation::GenerationRequest,
        Operation::RoleSwitch,
        Operation::ModeSet,
        Operation::RunClose,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::ArtifactProduce => "artifact.produce",
            Operation::ArtifactSupersede => "artifact.supersede",
            Operation::ArtifactEdit => "artifact.edit",
            Operation::ArtifactAnnotate => "artifact.annotate",
            Operation::GraphLink => "graph.link",
            Operation::GraphRead => "graph.read",
            Operation::LedgerRead => "ledger.read",
            Operation::IntegrityValidate => "integrity.validate",
            Operation::MetricEvaluate => "metric.evaluate",
            Operation::SignalPropose => "signal.propose",
            Operation::SignalNotify => "signal.notify",
            Operation::GateResolve => "gate.resolve",
            Operation::StageAdvance => "stage.advance",
            Operation::StageReplay => "stage.replay",
            Operation::BaselineFreeze => "baseline.freeze",
            Operation::ScopeChange => "scope.change",
            Operation::ScopeAdjust => "scope.adjust",
            Operation::DriftReport => "drift.report",
            Operation::DriftResolve => "drift.resolve",
            Operation::HaltImmediate => "halt.immediate",
            Operation::HaltResolve => "halt.resolve",
            Operation::GenerationRequest => "generation.request",
            Operation::RoleSwitch => "role.switch",
            Operation::ModeSet => "mode.set",
            Operation::RunClose => "run.close",
        }
    }

    /// Operations only a human may perform. These bypass the role check.
    pub fn is_human_only(&self) -> bool {
        matches!(
            self,
            Operation::GateResolve
                | Operation::ScopeAdjust
                | Operation::DriftResolve
                | Operation::HaltResolve
                | Operation::RoleSwitch
                | Operation::ModeSet
        )
    }

    /// Pure reads. Legal in every state, including after closure.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Operation::GraphRead | Operation::LedgerRead | Operation::IntegrityValidate
        )
    }

    /// Operations that create or change artifact content or graph structure.
    pub fn changes_content(&self) -> bool {
        matches!(
            self,
            Operation::ArtifactProduce
                | Operation::ArtifactSupersede
                | Operation::ArtifactEdit
                | Operation::GraphLink
                | Operation::ScopeChange
                | Operation::GenerationRequest
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Operation {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| PolicyError::UnknownOperation(s.to_string()))
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "actor", rename_all = "snake_case")]
pub enum Actor {
    /// Automated work on behalf of the active role.
    Agent,
    /// A person, identified for the audit trail.
    Human { identity: String },
}

impl Actor {
    pub fn human(identity: impl Into<String>) -> Self {
        Actor::Human {
            identity: identity.into(),
        }
    }

    /// The human identity, if this is a human with a non-blank identity.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Actor::Human { identity } if !identity.trim().is_empty() => Some(identity),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Agent => write!(f, "agent"),
            Actor::Human { identity } => write!(f, "human:{}", identity),
        }
    }
}

/// A request for a verdict on one operation.
///
/// Only the fields an operation's rules look at need to be set; the
/// builder methods keep call sites short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub operation: Operation,
    pub actor: Actor,
    /// Destination stage for advance, replay, adjust and gated proposals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<Stage>,
    /// Type of the artifact being produced or superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<ArtifactType>,
    /// The artifact being edited is frozen.
    #[serde(default)]
    pub target_frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_choice: Option<DriftChoice>,
}

impl ActionRequest {
    pub fn new(operation: Operation, actor: Actor) -> Self {
        Self {
            operation,
            actor,
            target_stage: None,
            artifact_type: None,
            target_frozen: false,
            target_mode: None,
            drift_choice: None,
        }
    }

    /// An automated request.
    pub fn agent(operation: Operation) -> Self {
        Self::new(operation, Actor::Agent)
    }

    /// A request made by a named human.
    pub fn human(operation: Operation, identity: impl Into<String>) -> Self {
        Self::new(operation, Actor::human(identity))
    }

    pub fn to_stage(mut self, stage: Stage) -> Self {
        self.target_stage = Some(stage);
        self
    }

    pub fn of_type(mut self, artifact_type: ArtifactType) -> Self {
        self.artifact_type = Some(artifact_type);
        self
    }

    pub fn on_frozen(mut self, frozen: bool) -> Self {
        self.target_frozen = frozen;
        self
    }

    pub fn to_mode(mut self, mode: ExecutionMode) -> Self {
        self.target_mode = Some(mode);
        self
    }

    pub fn with_drift_choice(mut self, choice: DriftChoice) -> Self {
        self.drift_choice = Some(choice);
        self
    }
}
