// entry.rs — Ledger entry data model.
//
// Every committed transition of a run is one LedgerEntry, one line in the
// run's JSONL ledger. Entries form a chain: each carries the hash of the
// entry before it (`prior_hash`) and its own hash over every other field.
//
// The payload is a tagged enum (`{"kind": "stage_advanced", ...}`). Each
// payload kind belongs to exactly one entry type, so a mismatched
// `entry_type` on disk is detectable.

use std::fmt;

use chrono::{DateTime, Utc};
use ks_graph::{hasher, ArtifactId, ArtifactType, Relation};
use ks_metrics::MetricReport;
use ks_policy::{
    DriftChoice, ExecutionMode, GateDecision, HaltChoice, HaltSource, Operation, RoleTag,
    RunOutcome, Stage,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// A human resolved a gated signal.
    Gate,
    /// A halt, drift pause, scope adjustment or their resolution.
    Intervention,
    /// A signal was emitted.
    Signal,
    /// A committed change to artifacts, stage, role, mode or run lifecycle.
    Decision,
    /// A banded metric snapshot.
    MetricSnapshot,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Gate => write!(f, "gate"),
            EntryType::Intervention => write!(f, "intervention"),
            EntryType::Signal => write!(f, "signal"),
            EntryType::Decision => write!(f, "decision"),
            EntryType::MetricSnapshot => write!(f, "metric_snapshot"),
        }
    }
}

/// What an entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    // ── decision ──
    RunStarted {
        title: String,
        role: RoleTag,
        mode: ExecutionMode,
        started_by: String,
    },
    ArtifactRegistered {
        artifact_id: ArtifactId,
        artifact_type: ArtifactType,
        hash: String,
        parent_hash: Option<String>,
        operation: Operation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supersedes: Option<ArtifactId>,
    },
    ArtifactEdited {
        artifact_id: ArtifactId,
        prior_hash: String,
        hash: String,
    },
    ArtifactAnnotated {
        artifact_id: ArtifactId,
        key: String,
        value: String,
    },
    EdgeAdded {
        from: ArtifactId,
        to: ArtifactId,
        relation: Relation,
    },
    StageAdvanced {
        signal_id: Uuid,
        from: Stage,
        to: Stage,
    },
    StageReplayed {
        from: Stage,
        to: Stage,
    },
    BaselineFrozen {
        artifact_ids: Vec<ArtifactId>,
    },
    RoleSwitched {
        from: RoleTag,
        to: RoleTag,
        identity: String,
    },
    ModeSet {
        from: ExecutionMode,
        to: ExecutionMode,
        identity: String,
    },
    IntegrityChecked {
        artifacts_checked: usize,
        edges_checked: usize,
        violations: Vec<String>,
    },
    RunClosed {
        outcome: RunOutcome,
    },

    // ── gate ──
    GateResolved {
        signal_id: Uuid,
        signal_type: String,
        decision: GateDecision,
        identity: String,
        stage_from: Stage,
        stage_to: Stage,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        frozen: Vec<ArtifactId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    // ── signal ──
    /// Carries the whole signal so the signal chain can be rebuilt from
    /// the ledger alone.
    SignalEmitted {
        signal_id: Uuid,
        signal_type: String,
        gated: bool,
        stage_from: Stage,
        stage_to: Option<Stage>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<ArtifactId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metric_snapshot: Option<MetricReport>,
        prior_signal_hash: Option<String>,
        emitted_at: DateTime<Utc>,
        signal_hash: String,
    },

    // ── intervention ──
    HaltRaised {
        source: HaltSource,
        reason: String,
    },
    HaltResolved {
        choice: HaltChoice,
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    DriftDetected {
        reason: String,
    },
    DriftResolved {
        choice: DriftChoice,
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ScopeAdjusted {
        origin: Stage,
        target: Stage,
        identity: String,
        reason: String,
    },

    // ── metric_snapshot ──
    MetricSnapshot {
        report: MetricReport,
    },
}

impl Payload {
    /// The entry type this payload belongs to.
    pub fn entry_type(&self) -> EntryType {
        match self {
            Payload::RunStarted { .. }
            | Payload::ArtifactRegistered { .. }
            | Payload::ArtifactEdited { .. }
            | Payload::ArtifactAnnotated { .. }
            | Payload::EdgeAdded { .. }
            | Payload::StageAdvanced { .. }
            | Payload::StageReplayed { .. }
            | Payload::BaselineFrozen { .. }
            | Payload::RoleSwitched { .. }
            | Payload::ModeSet { .. }
            | Payload::IntegrityChecked { .. }
            | Payload::RunClosed { .. } => EntryType::Decision,
            Payload::GateResolved { .. } => EntryType::Gate,
            Payload::SignalEmitted { .. } => EntryType::Signal,
            Payload::HaltRaised { .. }
            | Payload::HaltResolved { .. }
            | Payload::DriftDetected { .. }
            | Payload::DriftResolved { .. }
            | Payload::ScopeAdjusted { .. } => EntryType::Intervention,
            Payload::MetricSnapshot { .. } => EntryType::MetricSnapshot,
        }
    }

    /// The `kind` tag, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::RunStarted { .. } => "run_started",
            Payload::ArtifactRegistered { .. } => "artifact_registered",
            Payload::ArtifactEdited { .. } => "artifact_edited",
            Payload::ArtifactAnnotated { .. } => "artifact_annotated",
            Payload::EdgeAdded { .. } => "edge_added",
            Payload::StageAdvanced { .. } => "stage_advanced",
            Payload::StageReplayed { .. } => "stage_replayed",
            Payload::BaselineFrozen { .. } => "baseline_frozen",
            Payload::RoleSwitched { .. } => "role_switched",
            Payload::ModeSet { .. } => "mode_set",
            Payload::IntegrityChecked { .. } => "integrity_checked",
            Payload::RunClosed { .. } => "run_closed",
            Payload::GateResolved { .. } => "gate_resolved",
            Payload::SignalEmitted { .. } => "signal_emitted",
            Payload::HaltRaised { .. } => "halt_raised",
            Payload::HaltResolved { .. } => "halt_resolved",
            Payload::DriftDetected { .. } => "drift_detected",
            Payload::DriftResolved { .. } => "drift_resolved",
            Payload::ScopeAdjusted { .. } => "scope_adjusted",
            Payload::MetricSnapshot { .. } => "metric_snapshot",
        }
    }
}

/// One line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Position in the ledger, starting at 0.
    pub seq: u64,
    pub entry_type: EntryType,
    /// Stage the run was at when the entry was appended.
    pub stage: Stage,
    /// Active role when the entry was appended.
    pub role: RoleTag,
    pub payload: Payload,
    /// Hash of the previous entry; `None` for the first entry.
    pub prior_hash: Option<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Every field but `hash`, in declaration order. This is what gets hashed.
#[derive(Serialize)]
struct HashedFields<'a> {
    id: &'a Uuid,
    run_id: &'a Uuid,
    seq: u64,
    entry_type: EntryType,
    stage: Stage,
    role: RoleTag,
    payload: &'a Payload,
    prior_hash: &'a Option<String>,
    created_at: &'a DateTime<Utc>,
}

impl LedgerEntry {
    /// Build a sealed entry (hash computed) from its parts.
    pub fn seal(
        run_id: Uuid,
        seq: u64,
        stage: Stage,
        role: RoleTag,
        payload: Payload,
        prior_hash: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        let mut entry = Self {
            id: Uuid::new_v4(),
            run_id,
            seq,
            entry_type: payload.entry_type(),
            stage,
            role,
            payload,
            prior_hash,
            hash: String::new(),
            created_at: Utc::now(),
        };
        entry.hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// SHA-256 over the canonical JSON of every field except `hash`.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        hasher::hash_json(&HashedFields {
            id: &self.id,
            run_id: &self.run_id,
            seq: self.seq,
            entry_type: self.entry_type,
            stage: self.stage,
            role: self.role,
            payload: &self.payload,
            prior_hash: &self.prior_hash,
            created_at: &self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Payload {
        Payload::RunStarted {
            title: "t".into(),
            role: RoleTag::Analyst,
            mode: ExecutionMode::Standard,
            started_by: "dana".into(),
        }
    }

    #[test]
    fn seal_computes_hash_over_fields() {
        let entry =
            LedgerEntry::seal(Uuid::new_v4(), 0, Stage::Intake, RoleTag::Analyst, started(), None)
                .unwrap();
        assert_eq!(entry.hash, entry.compute_hash().unwrap());
        assert_eq!(entry.entry_type, EntryType::Decision);

        let mut tampered = entry.clone();
        tampered.stage = Stage::Framing;
        assert_ne!(tampered.compute_hash().unwrap(), entry.hash);
    }

    #[test]
    fn hash_survives_json_round_trip() {
        let report = ks_metrics::ThresholdEvaluator::default()
            .evaluate(&[ks_metrics::MetricResult::new("coherence", 0.7312345678901234)])
            .unwrap();
        let entry = LedgerEntry::seal(
            Uuid::new_v4(),
            3,
            Stage::Analysis,
            RoleTag::Observer,
            Payload::MetricSnapshot { report },
            Some("ab".repeat(32)),
        )
        .unwrap();
        let line = serde_json::to_string(&entry).unwrap();
        let back: LedgerEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.compute_hash().unwrap(), entry.hash);
    }

    #[test]
    fn payload_is_tagged_by_kind() {
        let json = serde_json::to_value(&Payload::StageAdvanced {
            signal_id: Uuid::nil(),
            from: Stage::Intake,
            to: Stage::Framing,
        })
        .unwrap();
        assert_eq!(json["kind"], "stage_advanced");
        assert_eq!(json["to"], "framing");
    }

    #[test]
    fn payload_kinds_map_to_entry_types() {
        assert_eq!(
            Payload::DriftDetected { reason: "x".into() }.entry_type(),
            EntryType::Intervention
        );
        assert_eq!(
            Payload::GateResolved {
                signal_id: Uuid::nil(),
                signal_type: "ready_for_framing".into(),
                decision: GateDecision::Reject,
                identity: "dana".into(),
                stage_from: Stage::Intake,
                stage_to: Stage::Framing,
                frozen: vec![],
                note: None,
            }
            .entry_type(),
            EntryType::Gate
        );
        assert_eq!(started().kind(), "run_started");
    }
}
