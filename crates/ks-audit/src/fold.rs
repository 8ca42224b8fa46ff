// fold.rs — Derive governance state from ledger entries.
//
// The governance state of a run is never stored on its own: it is the
// left fold of the ledger. Replaying the same entries always yields the
// same state, which is what makes a reloaded run indistinguishable from
// the one that was saved.

use ks_policy::{
    Adjustment, GateDecision, GateRef, GovernanceState, HaltChoice, HaltSource, HaltState,
    PauseState, RunOutcome, SignalMark, Stage,
};

use crate::entry::{LedgerEntry, Payload};

/// Apply one entry to the state.
pub fn apply(state: &mut GovernanceState, entry: &LedgerEntry) {
    match &entry.payload {
        Payload::RunStarted { role, mode, .. } => {
            state.started = true;
            state.role = *role;
            state.mode = *mode;
        }
        Payload::SignalEmitted {
            signal_id,
            signal_type,
            gated,
            stage_from,
            stage_to,
            ..
        } => {
            state.last_signal = Some(SignalMark {
                signal_id: *signal_id,
                signal_type: signal_type.clone(),
                status: if *gated { "pending" } else { "informational" }.to_string(),
            });
            if let (true, Some(to)) = (*gated, stage_to) {
                state.pending_gate = Some(GateRef {
                    signal_id: *signal_id,
                    signal_type: signal_type.clone(),
                    stage_from: *stage_from,
                    stage_to: *to,
                });
            }
        }
        Payload::GateResolved {
            signal_id,
            decision,
            ..
        } => {
            let gate = state.pending_gate.take();
            if let Some(mark) = state.last_signal.as_mut() {
                if mark.signal_id == *signal_id {
                    mark.status = match decision {
                        GateDecision::Approve => "approved",
                        GateDecision::Reject => "rejected",
                    }
                    .to_string();
                }
            }
            if *decision == GateDecision::Approve {
                state.approved_gate = gate;
            }
        }
        Payload::StageAdvanced { to, .. } => {
            state.stage = *to;
            state.approved_gate = None;
        }
        Payload::StageReplayed { to, .. } => {
            state.stage = *to;
            let finished = state
                .adjustment
                .as_ref()
                .is_some_and(|adj| adj.origin == *to);
            if finished {
                if let Some(adj) = state.adjustment.take() {
                    state.mode = adj.prior_mode;
                }
            }
        }
        Payload::BaselineFrozen { .. } => {
            state.baseline_frozen = true;
        }
        Payload::ArtifactRegistered { .. } | Payload::ArtifactEdited { .. } => {
            let stage = state.stage;
            if let Some(adj) = state.adjustment.as_mut() {
                if adj.target == stage {
                    adj.corrected = true;
                }
            }
        }
        Payload::MetricSnapshot { report } => {
            state.warning_streak = report.warning_streak;
            if report.halted {
                let names: Vec<&str> = report
                    .classified
                    .iter()
                    .filter(|m| m.band == ks_metrics::Band::Halt)
                    .map(|m| m.name.as_str())
                    .collect();
                state.halt = Some(HaltState {
                    source: HaltSource::Metric,
                    reason: format!("halt band: {}", names.join(", ")),
                    raised_at_seq: entry.seq,
                });
            }
        }
        Payload::HaltRaised { source, reason } => {
            state.halt = Some(HaltState {
                source: *source,
                reason: reason.clone(),
                raised_at_seq: entry.seq,
            });
        }
        Payload::HaltResolved { choice, .. } => {
            state.halt = None;
            if *choice == HaltChoice::Abandon {
                state.closed = true;
                state.outcome = Some(RunOutcome::Abandoned);
                state.pending_gate = None;
                state.approved_gate = None;
            }
        }
        Payload::DriftDetected { reason } => {
            state.pause = Some(PauseState {
                reason: reason.clone(),
                raised_at_seq: entry.seq,
            });
        }
        Payload::DriftResolved { .. } => {
            state.pause = None;
        }
        Payload::ScopeAdjusted { origin, target, .. } => {
            state.adjustment = Some(Adjustment {
                origin: *origin,
                target: *target,
                prior_mode: state.mode,
                corrected: false,
            });
            state.stage = *target;
            state.approved_gate = None;
            state.mode = ks_policy::ExecutionMode::Replay;
        }
        Payload::RoleSwitched { to, .. } => {
            state.role = *to;
        }
        Payload::ModeSet { to, .. } => {
            state.mode = *to;
        }
        Payload::RunClosed { outcome } => {
            state.closed = true;
            state.outcome = Some(*outcome);
            if *outcome == RunOutcome::Completed {
                state.stage = Stage::Closure;
            }
            state.approved_gate = None;
        }
        Payload::ArtifactAnnotated { .. }
        | Payload::EdgeAdded { .. }
        | Payload::IntegrityChecked { .. } => {}
    }
    state.entries = entry.seq + 1;
}

/// Fold a whole ledger from the initial state.
pub fn fold<'a>(
    run_id: uuid::Uuid,
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
) -> GovernanceState {
    let mut state = GovernanceState::new(run_id);
    for entry in entries {
        apply(&mut state, entry);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_policy::{ExecutionMode, RoleTag};
    use uuid::Uuid;

    fn chain(run_id: Uuid, payloads: Vec<Payload>) -> Vec<LedgerEntry> {
        let mut prior = None;
        let mut out = Vec::new();
        for (seq, payload) in payloads.into_iter().enumerate() {
            let entry = LedgerEntry::seal(
                run_id,
                seq as u64,
                Stage::Intake,
                RoleTag::Analyst,
                payload,
                prior.clone(),
            )
            .unwrap();
            prior = Some(entry.hash.clone());
            out.push(entry);
        }
        out
    }

    fn started() -> Payload {
        Payload::RunStarted {
            title: "t".into(),
            role: RoleTag::Analyst,
            mode: ExecutionMode::Standard,
            started_by: "dana".into(),
        }
    }

    #[test]
    fn gate_approval_then_advance() {
        let run_id = Uuid::new_v4();
        let signal_id = Uuid::new_v4();
        let entries = chain(
            run_id,
            vec![
                started(),
                Payload::SignalEmitted {
                    signal_id,
                    signal_type: "ready_for_framing".into(),
                    gated: true,
                    stage_from: Stage::Intake,
                    stage_to: Some(Stage::Framing),
                    metric_snapshot: None,
                    prior_signal_hash: None,
                    emitted_at: chrono::Utc::now(),
                    signal_hash: "h".into(),
                    artifacts: vec![],
                },
            ],
        );
        let state = fold(run_id, &entries);
        assert!(state.gate_pending());
        assert_eq!(state.status(), "gate_pending");

        let mut state = state;
        let more = chain(
            run_id,
            vec![
                Payload::GateResolved {
                    signal_id,
                    signal_type: "ready_for_framing".into(),
                    decision: GateDecision::Approve,
                    identity: "dana".into(),
                    stage_from: Stage::Intake,
                    stage_to: Stage::Framing,
                    frozen: vec![],
                    note: None,
                },
                Payload::StageAdvanced {
                    signal_id,
                    from: Stage::Intake,
                    to: Stage::Framing,
                },
            ],
        );
        apply(&mut state, &more[0]);
        assert!(!state.gate_pending());
        assert!(state.approved_gate.is_some());
        assert_eq!(state.last_signal.as_ref().unwrap().status, "approved");
        apply(&mut state, &more[1]);
        assert_eq!(state.stage, Stage::Framing);
        assert!(state.approved_gate.is_none());
    }

    #[test]
    fn scope_adjustment_enters_replay_and_restores_mode() {
        let run_id = Uuid::new_v4();
        let entries = chain(
            run_id,
            vec![
                started(),
                Payload::ScopeAdjusted {
                    origin: Stage::Synthesis,
                    target: Stage::Framing,
                    identity: "dana".into(),
                    reason: "frame too wide".into(),
                },
            ],
        );
        let mut state = fold(run_id, &entries);
        assert_eq!(state.stage, Stage::Framing);
        assert_eq!(state.mode, ExecutionMode::Replay);
        assert!(!state.adjustment.as_ref().unwrap().corrected);

        state.stage = Stage::Framing;
        let correction = chain(
            run_id,
            vec![Payload::ArtifactAnnotated {
                artifact_id: ks_graph::ArtifactId::new(),
                key: "k".into(),
                value: "v".into(),
            }],
        );
        apply(&mut state, &correction[0]);
        assert!(!state.adjustment.as_ref().unwrap().corrected);

        let edited = chain(
            run_id,
            vec![Payload::ArtifactEdited {
                artifact_id: ks_graph::ArtifactId::new(),
                prior_hash: "a".into(),
                hash: "b".into(),
            }],
        );
        apply(&mut state, &edited[0]);
        assert!(state.adjustment.as_ref().unwrap().corrected);

        for (from, to) in [
            (Stage::Framing, Stage::Baseline),
            (Stage::Baseline, Stage::Analysis),
            (Stage::Analysis, Stage::Synthesis),
        ] {
            let step = chain(run_id, vec![Payload::StageReplayed { from, to }]);
            apply(&mut state, &step[0]);
        }
        assert_eq!(state.stage, Stage::Synthesis);
        assert_eq!(state.mode, ExecutionMode::Standard);
        assert!(state.adjustment.is_none());
    }

    #[test]
    fn abandon_closes_the_run() {
        let run_id = Uuid::new_v4();
        let entries = chain(
            run_id,
            vec![
                started(),
                Payload::HaltRaised {
                    source: HaltSource::Manual,
                    reason: "stop".into(),
                },
                Payload::HaltResolved {
                    choice: HaltChoice::Abandon,
                    identity: "dana".into(),
                    note: None,
                },
            ],
        );
        let state = fold(run_id, &entries);
        assert!(!state.is_halted());
        assert!(state.closed);
        assert_eq!(state.status(), "abandoned");
        assert_eq!(state.entries, 3);
    }

    #[test]
    fn halting_snapshot_raises_metric_halt() {
        let run_id = Uuid::new_v4();
        let report = ks_metrics::ThresholdEvaluator::default()
            .evaluate(&[
                ks_metrics::MetricResult::new("coherence", 0.4999),
                ks_metrics::MetricResult::new("evidence_strength", 0.9),
            ])
            .unwrap();
        let entries = chain(run_id, vec![started(), Payload::MetricSnapshot { report }]);
        let state = fold(run_id, &entries);
        let halt = state.halt.unwrap();
        assert_eq!(halt.source, HaltSource::Metric);
        assert_eq!(halt.raised_at_seq, 1);
        assert!(halt.reason.contains("coherence"));
    }
}
