// signal.rs — Signals and the gate controller.
//
// A signal announces that something happened in a run: an artifact was
// produced, a metric snapshot was recorded, or the run is ready to move to
// the next stage. The "ready_for_*" signals are gated: the run waits until a
// human approves or rejects them.
//
// Signals form their own hash chain per run (`prior_signal_hash`), separate
// from the ledger chain. The ledger still records every signal in full, so
// the controller can be rebuilt from the ledger alone on resume.

use std::fmt;

use chrono::{DateTime, Utc};
use ks_audit::{LedgerEntry, Payload};
use ks_graph::{hasher, ArtifactId};
use ks_metrics::MetricReport;
use ks_policy::{GateDecision, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunError;

/// The fixed table of signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ReadyForFraming,
    ReadyForBaseline,
    ReadyForAnalysis,
    ReadyForSynthesis,
    ReadyForValidation,
    ReadyForReporting,
    ReadyForClosure,
    ArtifactProduced,
    MetricRecorded,
    DriftDetected,
    CheckpointSaved,
}

impl SignalType {
    pub const ALL: [SignalType; 11] = [
        SignalType::ReadyForFraming,
        SignalType::ReadyForBaseline,
        SignalType::ReadyForAnalysis,
        SignalType::ReadyForSynthesis,
        SignalType::ReadyForValidation,
        SignalType::ReadyForReporting,
        SignalType::ReadyForClosure,
        SignalType::ArtifactProduced,
        SignalType::MetricRecorded,
        SignalType::DriftDetected,
        SignalType::CheckpointSaved,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SignalType::ReadyForFraming => "ready_for_framing",
            SignalType::ReadyForBaseline => "ready_for_baseline",
            SignalType::ReadyForAnalysis => "ready_for_analysis",
            SignalType::ReadyForSynthesis => "ready_for_synthesis",
            SignalType::ReadyForValidation => "ready_for_validation",
            SignalType::ReadyForReporting => "ready_for_reporting",
            SignalType::ReadyForClosure => "ready_for_closure",
            SignalType::ArtifactProduced => "artifact_produced",
            SignalType::MetricRecorded => "metric_recorded",
            SignalType::DriftDetected => "drift_detected",
            SignalType::CheckpointSaved => "checkpoint_saved",
        }
    }

    /// The stage transition a gated signal asks for.
    pub fn transition(&self) -> Option<(Stage, Stage)> {
        match self {
            SignalType::ReadyForFraming => Some((Stage::Intake, Stage::Framing)),
            SignalType::ReadyForBaseline => Some((Stage::Framing, Stage::Baseline)),
            SignalType::ReadyForAnalysis => Some((Stage::Baseline, Stage::Analysis)),
            SignalType::ReadyForSynthesis => Some((Stage::Analysis, Stage::Synthesis)),
            SignalType::ReadyForValidation => Some((Stage::Synthesis, Stage::Validation)),
            SignalType::ReadyForReporting => Some((Stage::Validation, Stage::Reporting)),
            SignalType::ReadyForClosure => Some((Stage::Reporting, Stage::Closure)),
            _ => None,
        }
    }

    pub fn is_gated(&self) -> bool {
        self.transition().is_some()
    }

    /// The gated signal leading out of `stage`, if any.
    pub fn gate_for(stage: Stage) -> Option<SignalType> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.transition().is_some_and(|(from, _)| from == stage))
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SignalType {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| RunError::UnknownSignalType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Informational,
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::Informational => write!(f, "informational"),
            SignalStatus::Pending => write!(f, "pending"),
            SignalStatus::Approved => write!(f, "approved"),
            SignalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One emitted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub prior_signal_hash: Option<String>,
    pub stage_from: Stage,
    pub stage_to: Option<Stage>,
    pub artifacts_produced: Vec<ArtifactId>,
    pub metric_snapshot: Option<MetricReport>,
    pub gate_required: bool,
    pub hash: String,
    /// Not covered by `hash`: it changes when the gate is resolved.
    pub status: SignalStatus,
}

/// The hashed view of a signal.
#[derive(Serialize)]
struct SignalDigest<'a> {
    signal_id: &'a Uuid,
    signal_type: SignalType,
    run_id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    prior_signal_hash: &'a Option<String>,
    stage_from: Stage,
    stage_to: Option<Stage>,
    artifacts_produced: &'a [ArtifactId],
    metric_snapshot: &'a Option<MetricReport>,
    gate_required: bool,
}

impl Signal {
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        hasher::hash_json(&SignalDigest {
            signal_id: &self.signal_id,
            signal_type: self.signal_type,
            run_id: &self.run_id,
            timestamp: &self.timestamp,
            prior_signal_hash: &self.prior_signal_hash,
            stage_from: self.stage_from,
            stage_to: self.stage_to,
            artifacts_produced: &self.artifacts_produced,
            metric_snapshot: &self.metric_snapshot,
            gate_required: self.gate_required,
        })
    }

    /// The ledger payload recording this signal.
    pub fn to_payload(&self) -> Payload {
        Payload::SignalEmitted {
            signal_id: self.signal_id,
            signal_type: self.signal_type.name().to_string(),
            gated: self.gate_required,
            stage_from: self.stage_from,
            stage_to: self.stage_to,
            artifacts: self.artifacts_produced.clone(),
            metric_snapshot: self.metric_snapshot.clone(),
            prior_signal_hash: self.prior_signal_hash.clone(),
            emitted_at: self.timestamp,
            signal_hash: self.hash.clone(),
        }
    }
}

/// Emits signals, tracks the outstanding gate and resolves it.
#[derive(Debug, Clone)]
pub struct SignalGateController {
    run_id: Uuid,
    signals: Vec<Signal>,
}

impl SignalGateController {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            signals: Vec::new(),
        }
    }

    /// Rebuild the controller from ledger entries: every `signal_emitted`
    /// entry becomes a signal, every `gate_resolved` entry sets a status.
    pub fn from_ledger(run_id: Uuid, entries: &[LedgerEntry]) -> Result<Self, RunError> {
        let mut controller = Self::new(run_id);
        for entry in entries {
            match &entry.payload {
                Payload::SignalEmitted {
                    signal_id,
                    signal_type,
                    gated,
                    stage_from,
                    stage_to,
                    artifacts,
                    metric_snapshot,
                    prior_signal_hash,
                    emitted_at,
                    signal_hash,
                } => controller.signals.push(Signal {
                    signal_id: *signal_id,
                    signal_type: signal_type.parse()?,
                    run_id,
                    timestamp: *emitted_at,
                    prior_signal_hash: prior_signal_hash.clone(),
                    stage_from: *stage_from,
                    stage_to: *stage_to,
                    artifacts_produced: artifacts.clone(),
                    metric_snapshot: metric_snapshot.clone(),
                    gate_required: *gated,
                    hash: signal_hash.clone(),
                    status: if *gated {
                        SignalStatus::Pending
                    } else {
                        SignalStatus::Informational
                    },
                }),
                Payload::GateResolved {
                    signal_id,
                    decision,
                    ..
                } => {
                    let signal = controller
                        .signals
                        .iter_mut()
                        .find(|s| s.signal_id == *signal_id)
                        .ok_or(RunError::UnknownSignal(*signal_id))?;
                    signal.status = status_for(*decision);
                }
                _ => {}
            }
        }
        controller.verify_chain()?;
        Ok(controller)
    }

    /// Build and record a new signal.
    ///
    /// A gated signal must describe the transition out of `stage_from`, and
    /// only one gated signal may be pending at a time.
    pub fn emit(
        &mut self,
        signal_type: SignalType,
        stage_from: Stage,
        artifacts: Vec<ArtifactId>,
        metric_snapshot: Option<MetricReport>,
    ) -> Result<Signal, RunError> {
        let stage_to = match signal_type.transition() {
            Some((from, to)) => {
                if from != stage_from {
                    return Err(RunError::SignalStageMismatch {
                        signal_type: signal_type.to_string(),
                        stage: stage_from.to_string(),
                    });
                }
                if let Some(pending) = self.pending() {
                    return Err(RunError::Denied(ks_policy::DenialReason::GatePending {
                        signal_type: pending.signal_type.to_string(),
                    }));
                }
                Some(to)
            }
            None => None,
        };

        let gate_required = signal_type.is_gated();
        let mut signal = Signal {
            signal_id: Uuid::new_v4(),
            signal_type,
            run_id: self.run_id,
            timestamp: Utc::now(),
            prior_signal_hash: self.signals.last().map(|s| s.hash.clone()),
            stage_from,
            stage_to,
            artifacts_produced: artifacts,
            metric_snapshot,
            gate_required,
            hash: String::new(),
            status: if gate_required {
                SignalStatus::Pending
            } else {
                SignalStatus::Informational
            },
        };
        signal.hash = signal.compute_hash()?;

        tracing::debug!(
            signal_id = %signal.signal_id,
            signal_type = %signal.signal_type,
            gated = gate_required,
            "signal emitted"
        );
        self.signals.push(signal.clone());
        Ok(signal)
    }

    /// Resolve the pending gated signal. Returns the `gate` ledger payload,
    /// for approvals and rejections alike.
    pub fn resolve(
        &mut self,
        signal_id: Uuid,
        decision: GateDecision,
        identity: &str,
        frozen: Vec<ArtifactId>,
        note: Option<String>,
    ) -> Result<Payload, RunError> {
        let signal = self
            .signals
            .iter_mut()
            .find(|s| s.signal_id == signal_id)
            .ok_or(RunError::UnknownSignal(signal_id))?;
        if signal.status != SignalStatus::Pending {
            return Err(RunError::Denied(ks_policy::DenialReason::NoPendingGate));
        }
        let stage_to = signal.stage_to.ok_or(RunError::UnknownSignal(signal_id))?;
        signal.status = status_for(decision);

        Ok(Payload::GateResolved {
            signal_id,
            signal_type: signal.signal_type.to_string(),
            decision,
            identity: identity.to_string(),
            stage_from: signal.stage_from,
            stage_to,
            frozen,
            note,
        })
    }

    /// The outstanding gated signal, if any.
    pub fn pending(&self) -> Option<&Signal> {
        self.signals
            .iter()
            .rev()
            .find(|s| s.status == SignalStatus::Pending)
    }

    pub fn get(&self, signal_id: Uuid) -> Option<&Signal> {
        self.signals.iter().find(|s| s.signal_id == signal_id)
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn last(&self) -> Option<&Signal> {
        self.signals.last()
    }

    /// Check every signal's hash and its link to the one before it.
    pub fn verify_chain(&self) -> Result<(), RunError> {
        let mut prior: Option<&str> = None;
        for (index, signal) in self.signals.iter().enumerate() {
            if signal.prior_signal_hash.as_deref() != prior {
                return Err(RunError::SignalChainBroken {
                    index,
                    detail: "prior signal hash does not match".into(),
                });
            }
            if signal.compute_hash()? != signal.hash {
                return Err(RunError::SignalChainBroken {
                    index,
                    detail: "hash does not match signal content".into(),
                });
            }
            prior = Some(signal.hash.as_str());
        }
        Ok(())
    }
}

fn status_for(decision: GateDecision) -> SignalStatus {
    match decision {
        GateDecision::Approve => SignalStatus::Approved,
        GateDecision::Reject => SignalStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_gates_each_stage_once() {
        for stage in Stage::ALL {
            let gate = SignalType::gate_for(stage);
            assert_eq!(gate.is_some(), stage != Stage::Closure);
            if let Some(gate) = gate {
                assert_eq!(gate.transition().unwrap().1, stage.next().unwrap());
            }
        }
        assert!(!SignalType::MetricRecorded.is_gated());
        assert_eq!(
            "ready_for_closure".parse::<SignalType>().unwrap(),
            SignalType::ReadyForClosure
        );
    }

    #[test]
    fn signals_chain_and_verify() {
        let mut c = SignalGateController::new(Uuid::new_v4());
        let a = c
            .emit(SignalType::ArtifactProduced, Stage::Intake, vec![ArtifactId::new()], None)
            .unwrap();
        let b = c
            .emit(SignalType::ReadyForFraming, Stage::Intake, vec![], None)
            .unwrap();
        assert_eq!(a.prior_signal_hash, None);
        assert_eq!(b.prior_signal_hash.as_deref(), Some(a.hash.as_str()));
        assert_eq!(b.status, SignalStatus::Pending);
        assert!(c.verify_chain().is_ok());

        c.signals[0].artifacts_produced.clear();
        assert!(matches!(
            c.verify_chain(),
            Err(RunError::SignalChainBroken { index: 0, .. })
        ));
    }

    #[test]
    fn gated_signal_must_match_stage() {
        let mut c = SignalGateController::new(Uuid::new_v4());
        let err = c
            .emit(SignalType::ReadyForAnalysis, Stage::Intake, vec![], None)
            .unwrap_err();
        assert!(matches!(err, RunError::SignalStageMismatch { .. }));
    }

    #[test]
    fn only_one_gate_outstanding() {
        let mut c = SignalGateController::new(Uuid::new_v4());
        c.emit(SignalType::ReadyForFraming, Stage::Intake, vec![], None)
            .unwrap();
        assert!(c
            .emit(SignalType::ReadyForFraming, Stage::Intake, vec![], None)
            .is_err());
        // Informational signals still flow.
        assert!(c
            .emit(SignalType::MetricRecorded, Stage::Intake, vec![], None)
            .is_ok());
    }

    #[test]
    fn resolve_produces_gate_payload_for_reject() {
        let mut c = SignalGateController::new(Uuid::new_v4());
        let s = c
            .emit(SignalType::ReadyForFraming, Stage::Intake, vec![], None)
            .unwrap();
        let payload = c
            .resolve(s.signal_id, GateDecision::Reject, "dana", vec![], Some("thin".into()))
            .unwrap();
        assert_eq!(payload.entry_type(), ks_audit::EntryType::Gate);
        assert!(c.pending().is_none());
        assert_eq!(c.get(s.signal_id).unwrap().status, SignalStatus::Rejected);
        // A resolved gate cannot be resolved again.
        assert!(c
            .resolve(s.signal_id, GateDecision::Approve, "dana", vec![], None)
            .is_err());
    }

    #[test]
    fn rebuilds_from_ledger() {
        let run_id = Uuid::new_v4();
        let mut ledger =
            ks_audit::Ledger::in_memory(run_id, ks_policy::PermissionEngine::default());
        ledger
            .append(Payload::RunStarted {
                title: "t".into(),
                role: ks_policy::RoleTag::Analyst,
                mode: ks_policy::ExecutionMode::Standard,
                started_by: "dana".into(),
            })
            .unwrap();

        let mut c = SignalGateController::new(run_id);
        let s = c
            .emit(SignalType::ReadyForFraming, Stage::Intake, vec![], None)
            .unwrap();
        ledger.append(s.to_payload()).unwrap();
        let gate = c
            .resolve(s.signal_id, GateDecision::Approve, "dana", vec![], None)
            .unwrap();
        ledger.append(gate).unwrap();

        let rebuilt = SignalGateController::from_ledger(run_id, ledger.entries()).unwrap();
        assert_eq!(rebuilt.signals().len(), 1);
        assert_eq!(rebuilt.signals()[0].hash, s.hash);
        assert_eq!(rebuilt.signals()[0].status, SignalStatus::Approved);
    }
}
