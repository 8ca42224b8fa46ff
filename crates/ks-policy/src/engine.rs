// engine.rs — The permission state machine.
//
// `PermissionEngine::evaluate` is a pure function of (governance state,
// request). It never touches storage; callers act only on `Allow`.
// Checks run in a fixed order and the first failing check decides:
//
// 1. lifecycle   — not started / closed → only reads
// 2. halt        — halted → reads and halt resolution only
// 3. pause       — paused → reads, drift resolution, manual halt
// 4. gate        — gate pending → reads, gate resolution, notify, manual halt
// 5. actor       — human-only ops need a human identity; everything else
//                  is matched against the active role (forbidden, then
//                  permitted, default deny)
// 6. mode        — review/replay restrictions
// 7. state rules — per-operation preconditions (approved gate, baseline
//                  freeze, critical-path stage, adjustment rules)

use ks_graph::ArtifactType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{ActionRequest, Operation};
use crate::role::{RoleBook, RoleMatch, RoleTag};
use crate::stage::Stage;
use crate::state::{DriftChoice, ExecutionMode, GovernanceState, HaltSource};

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "denial", rename_all = "snake_case")]
pub enum DenialReason {
    #[error("run has not been started")]
    NotStarted,

    #[error("run is closed")]
    RunClosed,

    #[error("run is halted ({cause}): {reason}")]
    Halted { cause: HaltSource, reason: String },

    #[error("run is paused pending a drift decision: {reason}")]
    Paused { reason: String },

    #[error("gate '{signal_type}' is awaiting a human decision")]
    GatePending { signal_type: String },

    #[error("{operation} requires a human identity")]
    HumanRequired { operation: Operation },

    #[error("role {role} forbids {operation} (pattern '{pattern}')")]
    ForbiddenByRole {
        role: RoleTag,
        operation: Operation,
        pattern: String,
    },

    #[error("role {role} is not permitted {operation}")]
    NotPermittedByRole { role: RoleTag, operation: Operation },

    #[error("{mode} mode does not allow {operation}")]
    ModeForbids {
        mode: ExecutionMode,
        operation: Operation,
    },

    #[error("{operation} requires an approved gate")]
    NoApprovedGate { operation: Operation },

    #[error("approved transition leads to {expected}, request targets {requested}")]
    GateTargetMismatch { expected: Stage, requested: Stage },

    #[error("an approved gate to {stage_to} has not been acted on yet")]
    ApprovedGateUnconsumed { stage_to: Stage },

    #[error("the baseline must be frozen before leaving the baseline stage")]
    BaselineNotFrozen,

    #[error("the baseline is already frozen")]
    BaselineAlreadyFrozen,

    #[error("{operation} is not allowed once the baseline is frozen")]
    BaselineFrozen { operation: Operation },

    #[error("{operation} is only allowed at stage {required} (current: {current})")]
    WrongStage {
        operation: Operation,
        required: Stage,
        current: Stage,
    },

    #[error("{artifact_type} cannot be produced before {earliest} (current: {current})")]
    TooEarly {
        artifact_type: ArtifactType,
        earliest: Stage,
        current: Stage,
    },

    #[error("the target artifact is frozen")]
    ArtifactFrozen,

    #[error("there is no pending gate")]
    NoPendingGate,

    #[error("the run is not halted")]
    NotHalted,

    #[error("the run is not paused")]
    NotPaused,

    #[error("no scope micro-adjustment is in progress")]
    NoAdjustment,

    #[error("a correction artifact must be produced before replaying forward")]
    CorrectionRequired,

    #[error("a scope micro-adjustment is already in progress")]
    AdjustmentInProgress,

    #[error("cannot adjust back to {target} from {current}")]
    InvalidAdjustmentTarget { target: Stage, current: Stage },

    #[error("replay mode is entered only through a scope micro-adjustment")]
    ReplayModeReserved,

    #[error("{operation} request is missing {field}")]
    MissingField { operation: Operation, field: String },

    #[error("no stage follows {stage}")]
    TerminalStage { stage: Stage },

    #[error("entering closure uses run.close, not stage.advance")]
    ClosureRequiresRunClose,
}

/// Verdict on one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenialReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn denial(&self) -> Option<&DenialReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny(reason) => Some(reason),
        }
    }

    pub fn into_result(self) -> Result<(), DenialReason> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(reason),
        }
    }
}

/// A step in the evaluation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationStep {
    /// Which check was performed (e.g. "halt", "actor").
    pub check: String,
    /// "passed", or "denied: <reason>".
    pub outcome: String,
    /// Whether this step decided the verdict.
    pub terminal: bool,
}

/// A decision plus every check that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationTrace {
    pub decision: Decision,
    pub steps: Vec<EvaluationStep>,
    pub role: RoleTag,
    /// Role pattern that granted the operation, if the role was consulted.
    pub matched_pattern: Option<String>,
}

type Check = fn(&PermissionEngine, &GovernanceState, &ActionRequest) -> Result<(), DenialReason>;

/// Rules every request against the governance state and the role book.
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    roles: RoleBook,
}

impl PermissionEngine {
    pub fn new(roles: RoleBook) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &RoleBook {
        &self.roles
    }

    /// Rule on a request.
    pub fn evaluate(&self, state: &GovernanceState, request: &ActionRequest) -> Decision {
        self.evaluate_with_trace(state, request).decision
    }

    /// Rule on a request and record every check performed.
    pub fn evaluate_with_trace(
        &self,
        state: &GovernanceState,
        request: &ActionRequest,
    ) -> EvaluationTrace {
        let checks: [(&str, Check); 7] = [
            ("lifecycle", Self::check_lifecycle),
            ("halt", Self::check_halt),
            ("pause", Self::check_pause),
            ("gate", Self::check_gate),
            ("actor", Self::check_actor),
            ("mode", Self::check_mode),
            ("state_rules", Self::check_state_rules),
        ];

        let mut steps = Vec::with_capacity(checks.len());
        for (name, check) in checks {
            if let Err(reason) = check(self, state, request) {
                steps.push(EvaluationStep {
                    check: name.to_string(),
                    outcome: format!("denied: {}", reason),
                    terminal: true,
                });
                tracing::debug!(
                    operation = %request.operation,
                    actor = %request.actor,
                    check = name,
                    %reason,
                    "permission denied"
                );
                return EvaluationTrace {
                    decision: Decision::Deny(reason),
                    steps,
                    role: state.role,
                    matched_pattern: None,
                };
            }
            steps.push(EvaluationStep {
                check: name.to_string(),
                outcome: "passed".to_string(),
                terminal: false,
            });
        }

        if let Some(last) = steps.last_mut() {
            last.terminal = true;
        }
        let matched_pattern = if request.operation.is_human_only() {
            None
        } else {
            match self.roles.get(state.role).check(request.operation) {
                RoleMatch::Permitted(pattern) => Some(pattern),
                _ => None,
            }
        };
        tracing::debug!(operation = %request.operation, actor = %request.actor, "permission granted");
        EvaluationTrace {
            decision: Decision::Allow,
            steps,
            role: state.role,
            matched_pattern,
        }
    }

    fn check_lifecycle(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        if req.operation.is_read() {
            return Ok(());
        }
        if !state.started {
            return Err(DenialReason::NotStarted);
        }
        if state.closed {
            return Err(DenialReason::RunClosed);
        }
        Ok(())
    }

    fn check_halt(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        match &state.halt {
            Some(halt) if !(req.operation.is_read() || req.operation == Operation::HaltResolve) => {
                Err(DenialReason::Halted {
                    cause: halt.source,
                    reason: halt.reason.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_pause(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        let allowed = req.operation.is_read()
            || matches!(
                req.operation,
                Operation::DriftResolve | Operation::HaltImmediate
            );
        match &state.pause {
            Some(pause) if !allowed => Err(DenialReason::Paused {
                reason: pause.reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn check_gate(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        let allowed = req.operation.is_read()
            || matches!(
                req.operation,
                Operation::GateResolve | Operation::HaltImmediate | Operation::SignalNotify
            );
        match &state.pending_gate {
            Some(gate) if !allowed => Err(DenialReason::GatePending {
                signal_type: gate.signal_type.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn check_actor(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        let operation = req.operation;
        if operation.is_human_only() {
            return match req.actor.identity() {
                Some(_) => Ok(()),
                None => Err(DenialReason::HumanRequired { operation }),
            };
        }
        match self.roles.get(state.role).check(operation) {
            RoleMatch::Permitted(_) => Ok(()),
            RoleMatch::Forbidden(pattern) => Err(DenialReason::ForbiddenByRole {
                role: state.role,
                operation,
                pattern,
            }),
            RoleMatch::Unlisted => Err(DenialReason::NotPermittedByRole {
                role: state.role,
                operation,
            }),
        }
    }

    fn check_mode(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        let operation = req.operation;
        let progression = matches!(
            operation,
            Operation::SignalPropose
                | Operation::StageAdvance
                | Operation::BaselineFreeze
                | Operation::RunClose
        );
        let forbidden = match state.mode {
            ExecutionMode::Standard => false,
            ExecutionMode::Review => {
                progression || operation.changes_content() || operation == Operation::StageReplay
            }
            ExecutionMode::Replay => {
                // Corrections are confined to the stage jumped back to.
                let at_target = state
                    .adjustment
                    .as_ref()
                    .is_some_and(|adj| adj.target == state.stage);
                progression || (operation.changes_content() && !at_target)
            }
        };
        if forbidden {
            Err(DenialReason::ModeForbids {
                mode: state.mode,
                operation,
            })
        } else {
            Ok(())
        }
    }

    fn check_state_rules(&self, state: &GovernanceState, req: &ActionRequest) -> Result<(), DenialReason> {
        let operation = req.operation;
        let missing = |field: &str| DenialReason::MissingField {
            operation,
            field: field.to_string(),
        };

        match operation {
            Operation::ArtifactProduce | Operation::ArtifactSupersede => {
                let artifact_type = req.artifact_type.ok_or_else(|| missing("artifact_type"))?;
                let earliest = Stage::from_index(artifact_type.earliest_stage())
                    .unwrap_or(Stage::Closure);
                if artifact_type.is_critical_path() {
                    if let Some(adj) = &state.adjustment {
                        // During a micro-adjustment any critical artifact up
                        // to the adjusted stage may be corrected.
                        if earliest > adj.target {
                            return Err(DenialReason::WrongStage {
                                operation,
                                required: earliest,
                                current: state.stage,
                            });
                        }
                        return Ok(());
                    }
                    if state.baseline_frozen {
                        return Err(DenialReason::BaselineFrozen { operation });
                    }
                    if state.stage != earliest {
                        return Err(DenialReason::WrongStage {
                            operation,
                            required: earliest,
                            current: state.stage,
                        });
                    }
                } else if state.stage < earliest {
                    return Err(DenialReason::TooEarly {
                        artifact_type,
                        earliest,
                        current: state.stage,
                    });
                }
                Ok(())
            }

            Operation::ArtifactEdit => {
                if req.target_frozen {
                    Err(DenialReason::ArtifactFrozen)
                } else {
                    Ok(())
                }
            }

            Operation::ScopeChange => {
                if state.baseline_frozen && state.adjustment.is_none() {
                    Err(DenialReason::BaselineFrozen { operation })
                } else {
                    Ok(())
                }
            }

            Operation::SignalPropose => {
                let next = state
                    .stage
                    .next()
                    .ok_or(DenialReason::TerminalStage { stage: state.stage })?;
                if let Some(approved) = &state.approved_gate {
                    return Err(DenialReason::ApprovedGateUnconsumed {
                        stage_to: approved.stage_to,
                    });
                }
                let requested = req.target_stage.ok_or_else(|| missing("target_stage"))?;
                if requested != next {
                    return Err(DenialReason::GateTargetMismatch {
                        expected: next,
                        requested,
                    });
                }
                Ok(())
            }

            Operation::StageAdvance | Operation::RunClose => {
                let next = state
                    .stage
                    .next()
                    .ok_or(DenialReason::TerminalStage { stage: state.stage })?;
                if operation == Operation::StageAdvance && next == Stage::Closure {
                    return Err(DenialReason::ClosureRequiresRunClose);
                }
                if operation == Operation::RunClose && next != Stage::Closure {
                    return Err(DenialReason::WrongStage {
                        operation,
                        required: Stage::Reporting,
                        current: state.stage,
                    });
                }
                let approved = state
                    .approved_gate
                    .as_ref()
                    .ok_or(DenialReason::NoApprovedGate { operation })?;
                if approved.stage_to != next {
                    return Err(DenialReason::GateTargetMismatch {
                        expected: approved.stage_to,
                        requested: next,
                    });
                }
                if let Some(requested) = req.target_stage {
                    if requested != next {
                        return Err(DenialReason::GateTargetMismatch {
                            expected: next,
                            requested,
                        });
                    }
                }
                if state.stage == Stage::Baseline && !state.baseline_frozen {
                    return Err(DenialReason::BaselineNotFrozen);
                }
                Ok(())
            }

            Operation::BaselineFreeze => {
                if state.stage != Stage::Baseline {
                    return Err(DenialReason::WrongStage {
                        operation,
                        required: Stage::Baseline,
                        current: state.stage,
                    });
                }
                if state.baseline_frozen {
                    return Err(DenialReason::BaselineAlreadyFrozen);
                }
                match &state.approved_gate {
                    Some(gate) if gate.stage_from == Stage::Baseline => Ok(()),
                    _ => Err(DenialReason::NoApprovedGate { operation }),
                }
            }

            Operation::GateResolve => {
                if state.pending_gate.is_none() {
                    Err(DenialReason::NoPendingGate)
                } else {
                    Ok(())
                }
            }

            Operation::HaltResolve => {
                if state.halt.is_none() {
                    Err(DenialReason::NotHalted)
                } else {
                    Ok(())
                }
            }

            Operation::DriftResolve => {
                if state.pause.is_none() {
                    return Err(DenialReason::NotPaused);
                }
                let choice = req.drift_choice.ok_or_else(|| missing("drift_choice"))?;
                if choice == DriftChoice::ExpandScope && state.baseline_frozen {
                    return Err(DenialReason::BaselineFrozen { operation });
                }
                Ok(())
            }

            Operation::ScopeAdjust => {
                if state.adjustment.is_some() {
                    return Err(DenialReason::AdjustmentInProgress);
                }
                if let Some(approved) = &state.approved_gate {
                    return Err(DenialReason::ApprovedGateUnconsumed {
                        stage_to: approved.stage_to,
                    });
                }
                let target = req.target_stage.ok_or_else(|| missing("target_stage"))?;
                if target > Stage::Baseline || target >= state.stage {
                    return Err(DenialReason::InvalidAdjustmentTarget {
                        target,
                        current: state.stage,
                    });
                }
                Ok(())
            }

            Operation::StageReplay => {
                let adj = state.adjustment.as_ref().ok_or(DenialReason::NoAdjustment)?;
                if !adj.corrected {
                    return Err(DenialReason::CorrectionRequired);
                }
                if state.stage >= adj.origin {
                    return Err(DenialReason::NoAdjustment);
                }
                if let Some(requested) = req.target_stage {
                    let next = state
                        .stage
                        .next()
                        .ok_or(DenialReason::TerminalStage { stage: state.stage })?;
                    if requested != next {
                        return Err(DenialReason::GateTargetMismatch {
                            expected: next,
                            requested,
                        });
                    }
                }
                Ok(())
            }

            Operation::ModeSet => {
                let mode = req.target_mode.ok_or_else(|| missing("target_mode"))?;
                if mode == ExecutionMode::Replay {
                    return Err(DenialReason::ReplayModeReserved);
                }
                if state.adjustment.is_some() {
                    return Err(DenialReason::AdjustmentInProgress);
                }
                Ok(())
            }

            Operation::ArtifactAnnotate
            | Operation::GraphLink
            | Operation::GraphRead
            | Operation::LedgerRead
            | Operation::IntegrityValidate
            | Operation::MetricEvaluate
            | Operation::SignalNotify
            | Operation::DriftReport
            | Operation::HaltImmediate
            | Operation::GenerationRequest
            | Operation::RoleSwitch => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Adjustment, GateRef, HaltState, PauseState};
    use uuid::Uuid;

    fn engine() -> PermissionEngine {
        PermissionEngine::default()
    }

    fn started() -> GovernanceState {
        let mut state = GovernanceState::new(Uuid::new_v4());
        state.started = true;
        state
    }

    fn gate(from: Stage, to: Stage) -> GateRef {
        GateRef {
            signal_id: Uuid::new_v4(),
            signal_type: format!("ready_for_{}", to),
            stage_from: from,
            stage_to: to,
        }
    }

    fn deny(state: &GovernanceState, req: ActionRequest) -> DenialReason {
        match engine().evaluate(state, &req) {
            Decision::Deny(reason) => reason,
            Decision::Allow => panic!("expected denial for {}", req.operation),
        }
    }

    fn allow(state: &GovernanceState, req: ActionRequest) {
        let decision = engine().evaluate(state, &req);
        assert_eq!(decision, Decision::Allow, "expected {} to be allowed", req.operation);
    }

    #[test]
    fn nothing_but_reads_before_start() {
        let state = GovernanceState::new(Uuid::new_v4());
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::MetricEvaluate)),
            DenialReason::NotStarted
        );
        allow(&state, ActionRequest::agent(Operation::LedgerRead));
    }

    #[test]
    fn active_stage_allows_work_but_not_unapproved_advance() {
        let state = started();
        allow(
            &state,
            ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Evidence),
        );
        allow(&state, ActionRequest::agent(Operation::MetricEvaluate));
        allow(
            &state,
            ActionRequest::agent(Operation::SignalPropose).to_stage(Stage::Framing),
        );
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::StageAdvance)),
            DenialReason::NoApprovedGate {
                operation: Operation::StageAdvance
            }
        );
    }

    #[test]
    fn pending_gate_blocks_stage_work() {
        let mut state = started();
        state.pending_gate = Some(gate(Stage::Intake, Stage::Framing));

        for req in [
            ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Evidence),
            ActionRequest::agent(Operation::StageAdvance),
            ActionRequest::agent(Operation::MetricEvaluate),
        ] {
            assert!(matches!(deny(&state, req), DenialReason::GatePending { .. }));
        }
        allow(&state, ActionRequest::human(Operation::GateResolve, "dana"));
        allow(&state, ActionRequest::agent(Operation::GraphRead));
        allow(&state, ActionRequest::agent(Operation::HaltImmediate));
    }

    #[test]
    fn approved_gate_allows_advance_to_its_target_only() {
        let mut state = started();
        state.approved_gate = Some(gate(Stage::Intake, Stage::Framing));
        allow(&state, ActionRequest::agent(Operation::StageAdvance));
        allow(
            &state,
            ActionRequest::agent(Operation::StageAdvance).to_stage(Stage::Framing),
        );
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::StageAdvance).to_stage(Stage::Baseline)
            ),
            DenialReason::GateTargetMismatch { .. }
        ));
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::SignalPropose).to_stage(Stage::Framing)
            ),
            DenialReason::ApprovedGateUnconsumed { .. }
        ));
    }

    #[test]
    fn halt_blocks_all_automated_actions() {
        let mut state = started();
        state.halt = Some(HaltState {
            source: HaltSource::Metric,
            reason: "coherence below floor".into(),
            raised_at_seq: 5,
        });
        assert!(matches!(
            deny(&state, ActionRequest::agent(Operation::MetricEvaluate)),
            DenialReason::Halted {
                cause: HaltSource::Metric,
                ..
            }
        ));
        assert!(matches!(
            deny(&state, ActionRequest::human(Operation::GateResolve, "dana")),
            DenialReason::Halted { .. }
        ));
        allow(&state, ActionRequest::human(Operation::HaltResolve, "dana"));
        allow(&state, ActionRequest::agent(Operation::IntegrityValidate));
    }

    #[test]
    fn pause_waits_for_drift_decision() {
        let mut state = started();
        state.pause = Some(PauseState {
            reason: "out-of-scope section".into(),
            raised_at_seq: 2,
        });
        assert!(matches!(
            deny(&state, ActionRequest::agent(Operation::GenerationRequest)),
            DenialReason::Paused { .. }
        ));
        allow(
            &state,
            ActionRequest::human(Operation::DriftResolve, "dana")
                .with_drift_choice(DriftChoice::Clarify),
        );
    }

    #[test]
    fn expand_scope_refused_after_baseline_freeze() {
        let mut state = started();
        state.stage = Stage::Analysis;
        state.baseline_frozen = true;
        state.pause = Some(PauseState {
            reason: "drift".into(),
            raised_at_seq: 9,
        });
        assert_eq!(
            deny(
                &state,
                ActionRequest::human(Operation::DriftResolve, "dana")
                    .with_drift_choice(DriftChoice::ExpandScope)
            ),
            DenialReason::BaselineFrozen {
                operation: Operation::DriftResolve
            }
        );
        allow(
            &state,
            ActionRequest::human(Operation::DriftResolve, "dana")
                .with_drift_choice(DriftChoice::Exclude),
        );
    }

    #[test]
    fn closed_run_is_read_only() {
        let mut state = started();
        state.closed = true;
        assert_eq!(
            deny(&state, ActionRequest::human(Operation::ModeSet, "dana").to_mode(ExecutionMode::Review)),
            DenialReason::RunClosed
        );
        allow(&state, ActionRequest::agent(Operation::LedgerRead));
    }

    #[test]
    fn human_only_operations_need_identity() {
        let mut state = started();
        state.pending_gate = Some(gate(Stage::Intake, Stage::Framing));
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::GateResolve)),
            DenialReason::HumanRequired {
                operation: Operation::GateResolve
            }
        );
        assert!(matches!(
            deny(&state, ActionRequest::human(Operation::GateResolve, " ")),
            DenialReason::HumanRequired { .. }
        ));
    }

    #[test]
    fn role_patterns_gate_agent_operations() {
        let mut state = started();
        state.role = RoleTag::Observer;
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Evidence)
            ),
            DenialReason::ForbiddenByRole { .. }
        ));
        allow(&state, ActionRequest::agent(Operation::MetricEvaluate));

        state.role = RoleTag::Auditor;
        assert!(matches!(
            deny(&state, ActionRequest::agent(Operation::StageAdvance)),
            DenialReason::NotPermittedByRole { .. }
        ));
    }

    #[test]
    fn review_mode_blocks_content_and_progression() {
        let mut state = started();
        state.mode = ExecutionMode::Review;
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Evidence)
            ),
            DenialReason::ModeForbids { .. }
        ));
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::SignalPropose).to_stage(Stage::Framing)
            ),
            DenialReason::ModeForbids { .. }
        ));
        allow(&state, ActionRequest::agent(Operation::MetricEvaluate));
        allow(&state, ActionRequest::agent(Operation::ArtifactAnnotate));
    }

    #[test]
    fn critical_path_types_only_at_their_stage() {
        let mut state = started();
        state.stage = Stage::Framing;
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::ScopeStatement)
            ),
            DenialReason::WrongStage { .. }
        ));
        allow(
            &state,
            ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::ProblemFrame),
        );
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Synthesis)
            ),
            DenialReason::TooEarly { .. }
        ));
        allow(
            &state,
            ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Evidence),
        );
    }

    #[test]
    fn baseline_freeze_needs_approved_gate_at_baseline() {
        let mut state = started();
        state.stage = Stage::Baseline;
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::BaselineFreeze)),
            DenialReason::NoApprovedGate {
                operation: Operation::BaselineFreeze
            }
        );
        state.approved_gate = Some(gate(Stage::Baseline, Stage::Analysis));
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::StageAdvance)),
            DenialReason::BaselineNotFrozen
        );
        allow(&state, ActionRequest::agent(Operation::BaselineFreeze));

        state.baseline_frozen = true;
        allow(&state, ActionRequest::agent(Operation::StageAdvance));
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::BaselineFreeze)),
            DenialReason::BaselineAlreadyFrozen
        );
    }

    #[test]
    fn frozen_baseline_blocks_scope_change_and_frozen_edits() {
        let mut state = started();
        state.stage = Stage::Analysis;
        state.baseline_frozen = true;
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::ScopeChange)),
            DenialReason::BaselineFrozen {
                operation: Operation::ScopeChange
            }
        );
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::ArtifactEdit).on_frozen(true)),
            DenialReason::ArtifactFrozen
        );
        allow(&state, ActionRequest::agent(Operation::ArtifactEdit));
        allow(
            &state,
            ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::AnalysisNote),
        );
    }

    #[test]
    fn micro_adjustment_rules() {
        let mut state = started();
        state.stage = Stage::Analysis;
        state.baseline_frozen = true;

        assert!(matches!(
            deny(
                &state,
                ActionRequest::human(Operation::ScopeAdjust, "dana").to_stage(Stage::Synthesis)
            ),
            DenialReason::InvalidAdjustmentTarget { .. }
        ));
        allow(
            &state,
            ActionRequest::human(Operation::ScopeAdjust, "dana").to_stage(Stage::Intake),
        );

        // Jumped back to intake in replay mode.
        state.stage = Stage::Intake;
        state.mode = ExecutionMode::Replay;
        state.adjustment = Some(Adjustment {
            origin: Stage::Analysis,
            target: Stage::Intake,
            prior_mode: ExecutionMode::Standard,
            corrected: false,
        });
        allow(&state, ActionRequest::agent(Operation::ScopeChange));
        allow(
            &state,
            ActionRequest::agent(Operation::ArtifactSupersede).of_type(ArtifactType::ScopeStatement),
        );
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::StageReplay)),
            DenialReason::CorrectionRequired
        );
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::SignalPropose).to_stage(Stage::Framing)
            ),
            DenialReason::ModeForbids { .. }
        ));
        assert_eq!(
            deny(
                &state,
                ActionRequest::human(Operation::ModeSet, "dana").to_mode(ExecutionMode::Standard)
            ),
            DenialReason::AdjustmentInProgress
        );

        if let Some(adj) = state.adjustment.as_mut() {
            adj.corrected = true;
        }
        allow(&state, ActionRequest::agent(Operation::StageReplay));

        // After replaying one stage, content changes are confined to the target.
        state.stage = Stage::Framing;
        assert!(matches!(
            deny(
                &state,
                ActionRequest::agent(Operation::ArtifactProduce).of_type(ArtifactType::Hypothesis)
            ),
            DenialReason::ModeForbids { .. }
        ));
    }

    #[test]
    fn closure_goes_through_run_close() {
        let mut state = started();
        state.stage = Stage::Reporting;
        state.baseline_frozen = true;
        state.approved_gate = Some(gate(Stage::Reporting, Stage::Closure));
        assert_eq!(
            deny(&state, ActionRequest::agent(Operation::StageAdvance)),
            DenialReason::ClosureRequiresRunClose
        );
        allow(&state, ActionRequest::agent(Operation::RunClose));

        state.stage = Stage::Validation;
        state.approved_gate = Some(gate(Stage::Validation, Stage::Reporting));
        assert!(matches!(
            deny(&state, ActionRequest::agent(Operation::RunClose)),
            DenialReason::WrongStage { .. }
        ));
    }

    #[test]
    fn replay_mode_cannot_be_set_directly() {
        let state = started();
        assert_eq!(
            deny(
                &state,
                ActionRequest::human(Operation::ModeSet, "dana").to_mode(ExecutionMode::Replay)
            ),
            DenialReason::ReplayModeReserved
        );
    }

    #[test]
    fn trace_records_each_check() {
        let mut state = started();
        let trace = engine().evaluate_with_trace(&state, &ActionRequest::agent(Operation::GraphLink));
        assert!(trace.decision.is_allowed());
        assert_eq!(trace.steps.len(), 7);
        assert!(trace.steps.last().unwrap().terminal);
        assert_eq!(trace.matched_pattern.as_deref(), Some("*"));

        state.pending_gate = Some(gate(Stage::Intake, Stage::Framing));
        let trace = engine().evaluate_with_trace(&state, &ActionRequest::agent(Operation::GraphLink));
        assert!(!trace.decision.is_allowed());
        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.steps[3].check, "gate");
        assert!(trace.steps[3].outcome.starts_with("denied:"));
    }

    #[test]
    fn decision_serializes_with_reason() {
        let decision = Decision::Deny(DenialReason::NoPendingGate);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["reason"]["denial"], "no_pending_gate");
    }

    #[test]
    fn denial_with_reason_field_round_trips() {
        let decision = Decision::Deny(DenialReason::Halted {
            cause: HaltSource::Manual,
            reason: "source data withdrawn".into(),
        });
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"]["denial"], "halted");
        assert_eq!(json["reason"]["reason"], "source data withdrawn");

        let back: Decision = serde_json::from_value(json).unwrap();
        assert_eq!(back, decision);

        let paused = DenialReason::Paused {
            reason: "scope drift".into(),
        };
        let text = serde_json::to_string(&paused).unwrap();
        assert_eq!(serde_json::from_str::<DenialReason>(&text).unwrap(), paused);
    }
}
