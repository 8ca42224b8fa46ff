// run_lifecycle.rs — End-to-end tests for persistent runs.
//
// Each test works in a scratch project directory with the standard
// `.keystone/` layout, drives a run through `Session`, and checks what
// lands on disk: the ledger, the envelopes and the snapshot.

use std::fs;
use std::time::Duration;

use ks_audit::{Ledger, Payload};
use ks_graph::{ArtifactGraph, ArtifactType, GraphError, IntegrityViolation, Relation};
use ks_metrics::{Band, MetricResult};
use ks_policy::{DenialReason, ExecutionMode, GateDecision, HaltChoice, HaltSource, Stage};
use ks_run::{
    CollaboratorError, ErrorKind, GenerationRequest, GenerationService, KeystoneConfig, RunError,
    RunLocation, RunStatus, RunStore, Session, SessionHandle, SessionOptions,
};
use tempfile::TempDir;

struct Project {
    _dir: TempDir,
    config: KeystoneConfig,
    store: RunStore,
}

fn project() -> Project {
    let dir = TempDir::new().unwrap();
    let config = KeystoneConfig::for_project(dir.path());
    let store = RunStore::for_config(&config);
    Project {
        _dir: dir,
        config,
        store,
    }
}

fn start(p: &Project) -> Session {
    Session::start(&p.store, "pricing study", "dana", SessionOptions::default()).unwrap()
}

fn resume(p: &Project, session: &Session) -> Result<Session, RunError> {
    Session::resume(&p.store, session.run_id(), SessionOptions::default())
}

/// The graph index as JSON, for whole-graph comparisons.
fn index_json(graph: &ArtifactGraph) -> String {
    serde_json::to_string(&graph.index()).unwrap()
}

fn pass_gate(s: &mut Session) -> Stage {
    s.propose_advance().unwrap();
    s.resolve_gate(GateDecision::Approve, "dana", None).unwrap();
    s.advance_stage().unwrap()
}

#[test]
fn persisted_run_reloads_identically() {
    let p = project();
    let mut s = start(&p);
    let scope = s
        .produce_artifact(ArtifactType::ScopeStatement, "Which tiers to reprice?", &[])
        .unwrap();
    let evidence = s
        .produce_artifact(
            ArtifactType::Evidence,
            "churn by tier",
            &[(scope, Relation::References)],
        )
        .unwrap();
    s.annotate_artifact(evidence, "source", "billing export")
        .unwrap();
    pass_gate(&mut s);
    s.save_snapshot().unwrap();

    let reloaded = resume(&p, &s).unwrap();
    assert_eq!(reloaded.state(), s.state());
    assert_eq!(index_json(reloaded.graph()), index_json(s.graph()));
    assert_eq!(reloaded.graph().bodies(), s.graph().bodies());
    assert_eq!(reloaded.signals().signals(), s.signals().signals());
    assert_eq!(reloaded.context_projection(), s.context_projection());

    let ledger_path = RunStore::ledger_path(s.dir().unwrap());
    assert_eq!(Ledger::verify_file(&ledger_path).unwrap(), s.ledger().len());
}

#[test]
fn resume_replays_entries_after_the_snapshot() {
    let p = project();
    let mut s = start(&p);
    // Only the snapshot written at start exists; everything below lives in
    // the ledger and the envelopes.
    let scope = s
        .produce_artifact(ArtifactType::ScopeStatement, "scope", &[])
        .unwrap();
    let a = s
        .produce_artifact(ArtifactType::Evidence, "draft", &[])
        .unwrap();
    s.edit_artifact(a, "final").unwrap();
    s.link_artifacts(a, scope, Relation::References).unwrap();
    let b = s
        .produce_artifact(
            ArtifactType::Evidence,
            "cross-check",
            &[(scope, Relation::DerivedFrom), (a, Relation::References)],
        )
        .unwrap();
    s.propose_advance().unwrap();
    s.resolve_gate(GateDecision::Approve, "dana", None).unwrap();
    assert!(s.is_dirty());

    let reloaded = resume(&p, &s).unwrap();
    assert_eq!(reloaded.graph().len(), 3);
    assert_eq!(reloaded.graph().get(a).unwrap().content, "final");
    assert!(reloaded.graph().get(a).unwrap().is_immutable);
    assert_eq!(reloaded.graph().dependencies_of(a).unwrap(), vec![scope]);
    assert_eq!(index_json(reloaded.graph()), index_json(s.graph()));
    assert_eq!(reloaded.graph().dependencies_of(b).unwrap().len(), 2);
    assert_eq!(reloaded.state(), s.state());
}

#[test]
fn corrupted_ledger_is_detected() {
    let p = project();
    let mut s = start(&p);
    s.produce_artifact(ArtifactType::Evidence, "notes", &[])
        .unwrap();
    let ledger_path = RunStore::ledger_path(s.dir().unwrap());
    s.save_snapshot().unwrap();

    let text = fs::read_to_string(&ledger_path).unwrap();
    fs::write(&ledger_path, text.replacen("pricing study", "pricing studies", 1)).unwrap();

    assert!(Ledger::verify_file(&ledger_path).is_err());
    assert!(matches!(resume(&p, &s), Err(RunError::Ledger(_))));
}

#[test]
fn tampered_envelope_is_detected() {
    let p = project();
    let mut s = start(&p);
    let a = s
        .produce_artifact(ArtifactType::Evidence, "original body", &[])
        .unwrap();
    s.save_snapshot().unwrap();

    let envelope = RunStore::artifacts_dir(s.dir().unwrap()).join(format!("{}.md", a));
    let text = fs::read_to_string(&envelope).unwrap();
    fs::write(&envelope, text.replace("original body", "rewritten body")).unwrap();

    let err = resume(&p, &s).unwrap_err();
    assert!(matches!(
        err,
        RunError::Graph(GraphError::Integrity(IntegrityViolation::HashMismatch { .. }))
    ));

    // The failed resume leaves an integrity halt in the ledger.
    let ledger_path = RunStore::ledger_path(s.dir().unwrap());
    let halts = |path: &std::path::Path| {
        Ledger::read_all(path)
            .unwrap()
            .into_iter()
            .filter(|e| {
                matches!(
                    e.payload,
                    Payload::HaltRaised {
                        source: HaltSource::Integrity,
                        ..
                    }
                )
            })
            .count()
    };
    assert_eq!(halts(ledger_path.as_path()), 1);
    assert!(resume(&p, &s).is_err());
    assert_eq!(halts(ledger_path.as_path()), 1);

    // Putting the body back does not lift the halt.
    fs::write(&envelope, text).unwrap();
    let reloaded = resume(&p, &s).unwrap();
    let halt = reloaded.state().halt.as_ref().unwrap();
    assert_eq!(halt.source, HaltSource::Integrity);
    assert!(reloaded.state().is_halted());
}

#[test]
fn envelope_tampered_after_snapshot_halts_on_replay() {
    let p = project();
    let mut s = start(&p);
    // Registered after the start snapshot, so resume reaches it by replay.
    let a = s
        .produce_artifact(ArtifactType::Evidence, "churn by tier", &[])
        .unwrap();

    let envelope = RunStore::artifacts_dir(s.dir().unwrap()).join(format!("{}.md", a));
    let text = fs::read_to_string(&envelope).unwrap();
    fs::write(&envelope, text.replace("churn by tier", "churn by region")).unwrap();

    let err = resume(&p, &s).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    let entries = Ledger::read_all(RunStore::ledger_path(s.dir().unwrap())).unwrap();
    assert!(matches!(
        entries.last().map(|e| &e.payload),
        Some(Payload::HaltRaised {
            source: HaltSource::Integrity,
            ..
        })
    ));
}

#[test]
fn cycle_is_rejected_and_graph_unchanged() {
    let p = project();
    let mut s = start(&p);
    let a = s.produce_artifact(ArtifactType::Evidence, "a", &[]).unwrap();
    let b = s
        .produce_artifact(ArtifactType::Evidence, "b", &[(a, Relation::References)])
        .unwrap();
    let c = s
        .produce_artifact(ArtifactType::Evidence, "c", &[(b, Relation::DerivedFrom)])
        .unwrap();
    let before = index_json(s.graph());

    let err = s.link_artifacts(a, c, Relation::References).unwrap_err();
    assert!(matches!(err, RunError::Graph(GraphError::CycleDetected { .. })));
    assert_eq!(index_json(s.graph()), before);

    s.save_snapshot().unwrap();
    let reloaded = resume(&p, &s).unwrap();
    assert_eq!(index_json(reloaded.graph()), before);
}

#[test]
fn frozen_artifact_cannot_be_registered_again() {
    let p = project();
    let mut s = start(&p);
    let a = s
        .produce_artifact(ArtifactType::Evidence, "measured", &[])
        .unwrap();
    s.propose_advance().unwrap();
    s.resolve_gate(GateDecision::Approve, "dana", None).unwrap();

    let mut graph = s.graph().clone();
    let mut altered = graph.get(a).unwrap().clone();
    altered.content = "re-measured".into();
    altered.hash = altered.compute_hash();
    let err = graph.register(altered).unwrap_err();
    assert!(matches!(
        err,
        GraphError::Integrity(IntegrityViolation::ImmutableMutation { .. })
    ));
    assert_eq!(graph.get(a).unwrap().content, "measured");

    let ledger_len = s.ledger().len();
    let err = s.edit_artifact(a, "re-measured").unwrap_err();
    assert!(matches!(err, RunError::Denied(DenialReason::ArtifactFrozen)));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(s.graph().get(a).unwrap().content, "measured");
    assert_eq!(s.ledger().len(), ledger_len);
    assert!(!s.state().is_halted());
}

#[test]
fn gate_blocks_until_resolved_and_rejection_keeps_stage() {
    let p = project();
    let mut s = start(&p);
    s.produce_artifact(ArtifactType::ScopeStatement, "scope", &[])
        .unwrap();
    let signal = s.propose_advance().unwrap();
    assert!(matches!(
        s.advance_stage(),
        Err(RunError::Denied(DenialReason::GatePending { .. }))
    ));

    s.resolve_gate(GateDecision::Reject, "dana", Some("scope too vague".into()))
        .unwrap();
    assert_eq!(s.state().stage, Stage::Intake);
    assert!(!s.state().gate_pending());
    let recorded = s.ledger().entries().iter().any(|e| {
        matches!(
            &e.payload,
            Payload::GateResolved { signal_id, decision: GateDecision::Reject, note: Some(_), .. }
                if *signal_id == signal.signal_id
        )
    });
    assert!(recorded);
    assert!(s.advance_stage().is_err());

    // A fresh proposal can follow a rejection.
    s.propose_advance().unwrap();
    s.resolve_gate(GateDecision::Approve, "dana", None).unwrap();
    assert_eq!(s.advance_stage().unwrap(), Stage::Framing);
}

#[test]
fn halt_floor_is_exclusive() {
    let p = project();
    let mut s = start(&p);
    let report = s
        .evaluate_metrics(&[MetricResult::new("coherence", 0.50)])
        .unwrap();
    assert!(!report.halted);
    assert_eq!(s.run().status, RunStatus::Active);

    let report = s
        .evaluate_metrics(&[MetricResult::new("coherence", 0.4999)])
        .unwrap();
    assert!(report.halted);
    assert_eq!(report.get("coherence").unwrap().band, Band::Halt);
    assert_eq!(s.run().status, RunStatus::Halted);
    assert!(s.context_projection().contains("coherence:0.50H"));
}

#[test]
fn warning_and_pass_survive_reload() {
    let p = project();
    let mut s = start(&p);
    let report = s
        .evaluate_metrics(&[
            MetricResult::new("coherence", 0.70),
            MetricResult::new("redundancy", 0.10),
        ])
        .unwrap();
    assert!(!report.halted);
    s.save_snapshot().unwrap();

    let reloaded = resume(&p, &s).unwrap();
    let stored = reloaded.ledger().latest_metric_report().unwrap();
    assert_eq!(stored.get("coherence").unwrap().band, Band::Warning);
    assert_eq!(stored.get("redundancy").unwrap().band, Band::Pass);
    assert!(!reloaded.state().is_halted());
}

#[test]
fn micro_adjustment_survives_resume() {
    let p = project();
    let mut s = start(&p);
    s.produce_artifact(ArtifactType::ScopeStatement, "scope", &[])
        .unwrap();
    pass_gate(&mut s);
    let frame = s
        .produce_artifact(ArtifactType::ProblemFrame, "frame", &[])
        .unwrap();
    pass_gate(&mut s);
    s.produce_artifact(ArtifactType::Baseline, "baseline", &[])
        .unwrap();
    pass_gate(&mut s);
    assert_eq!(s.state().stage, Stage::Analysis);

    s.micro_adjust(Stage::Framing, "dana", "segment missing")
        .unwrap();
    let corrected = s.supersede_artifact(frame, "frame with segment").unwrap();

    let mut s = resume(&p, &s).unwrap();
    assert_eq!(s.state().mode, ExecutionMode::Replay);
    assert!(s.state().adjustment.as_ref().unwrap().corrected);
    assert!(s.graph().contains(corrected));

    assert_eq!(s.replay_forward().unwrap(), Stage::Analysis);
    assert_eq!(s.state().mode, ExecutionMode::Standard);
}

#[test]
fn closing_archives_the_run() {
    let p = project();
    let mut s = start(&p);
    s.produce_artifact(ArtifactType::ScopeStatement, "scope", &[])
        .unwrap();
    pass_gate(&mut s);
    s.produce_artifact(ArtifactType::ProblemFrame, "frame", &[])
        .unwrap();
    pass_gate(&mut s);
    s.produce_artifact(ArtifactType::Baseline, "baseline", &[])
        .unwrap();
    while s.state().stage != Stage::Reporting {
        pass_gate(&mut s);
    }
    s.produce_artifact(ArtifactType::FinalReport, "report", &[])
        .unwrap();
    assert_eq!(pass_gate(&mut s), Stage::Closure);

    assert!(s.run().archived);
    assert_eq!(p.store.locate(s.run_id()).unwrap().1, RunLocation::Archived);
    assert!(p.store.list(false).unwrap().is_empty());
    assert_eq!(p.store.list(true).unwrap()[0].status, RunStatus::Closed);

    let reloaded = resume(&p, &s).unwrap();
    assert!(reloaded.run().archived);
    assert_eq!(reloaded.state().stage, Stage::Closure);
    assert!(p.config.archive_dir.join(s.run_id().to_string()).is_dir());
}

#[test]
fn abandoning_a_halted_run_archives_it() {
    let p = project();
    let mut s = start(&p);
    s.halt_immediate("source data withdrawn").unwrap();
    s.resolve_halt(HaltChoice::Abandon, "dana", None).unwrap();
    assert_eq!(s.run().status, RunStatus::Abandoned);
    assert_eq!(p.store.locate(s.run_id()).unwrap().1, RunLocation::Archived);
}

/// Halts the run while its generation call is in flight.
struct HaltingService {
    handle: SessionHandle,
}

impl GenerationService for HaltingService {
    fn generate(&self, _request: &GenerationRequest) -> Result<String, CollaboratorError> {
        self.handle
            .with_session(|s| s.halt_immediate("operator stop"))
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;
        Ok("late content".into())
    }
}

#[test]
fn generation_after_halt_is_discarded() {
    let p = project();
    let handle = SessionHandle::new(start(&p));
    let service = HaltingService {
        handle: handle.clone(),
    };

    let err = handle
        .generate(&service, ArtifactType::Evidence, "summarise interviews")
        .unwrap_err();
    assert!(matches!(err, RunError::Discarded(_)));

    let view = handle.view().unwrap();
    assert_eq!(view.run.status, RunStatus::Halted);
    assert!(view.run.artifact_ids.is_empty());
}

#[tokio::test]
async fn autosave_writes_committed_changes() {
    let p = project();
    let handle = SessionHandle::new(start(&p));
    let id = handle
        .with_session(|s| s.produce_artifact(ArtifactType::Evidence, "notes", &[]))
        .unwrap();

    let task = handle.spawn_autosave(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(120)).await;
    task.shutdown().await.unwrap();

    let dir = handle
        .with_session(|s| Ok(s.dir().map(|d| d.to_path_buf())))
        .unwrap()
        .unwrap();
    let snapshot = RunStore::load_snapshot(&dir).unwrap().unwrap();
    assert_eq!(snapshot.run.artifact_ids, vec![id]);
    assert!(!handle.with_session(|s| Ok(s.is_dirty())).unwrap());
}
