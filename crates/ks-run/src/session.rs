// session.rs — Session: the explicit handle that drives one run.
//
// Every operation follows the same shape:
//
//   1. propose the action to the ledger (permission engine, no side effect)
//   2. apply it to the in-memory graph and write envelopes
//   3. append the ledger entry
//
// If step 3 fails, step 2 is rolled back: the graph returns to its
// checkpoint (or its pre-write clone) and rewritten envelopes are restored.
// The ledger is the authority; nothing counts until its entry is appended.
//
// Resuming a run loads the last snapshot and replays the ledger entries
// written after it, so a crash between an append and the next snapshot
// loses nothing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ks_audit::{Ledger, LedgerEntry, Payload};
use ks_graph::{
    Artifact, ArtifactGraph, ArtifactId, ArtifactStore, ArtifactType, DependencyRef, GraphError,
    GraphIndex, IntegrityReport, Relation,
};
use ks_metrics::{MetricReport, MetricResult, ThresholdEvaluator};
use ks_policy::{
    ActionRequest, DenialReason, DriftChoice, ExecutionMode, GateDecision, GovernanceState,
    HaltChoice, HaltSource, Operation, PermissionEngine, RoleTag, RunOutcome, Stage,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborator::{
    GenerationRequest, GenerationService, MetricRequest, MetricService, RetryPolicy,
};
use crate::config::KeystoneConfig;
use crate::error::{ErrorKind, RunError};
use crate::events::{EventDispatcher, KsEvent, LogSink};
use crate::projection;
use crate::run::Run;
use crate::signal::{Signal, SignalGateController, SignalType};
use crate::store::{RunLocation, RunSnapshot, RunStore};

/// Everything a session needs besides the run itself.
pub struct SessionOptions {
    pub engine: PermissionEngine,
    pub evaluator: ThresholdEvaluator,
    pub retry: RetryPolicy,
    /// Recorded as the author of produced artifacts.
    pub author: String,
    /// Role and mode the run starts in.
    pub role: RoleTag,
    pub mode: ExecutionMode,
    pub events: EventDispatcher,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            engine: PermissionEngine::default(),
            evaluator: ThresholdEvaluator::default(),
            retry: RetryPolicy::default(),
            author: "keystone".to_string(),
            role: RoleTag::default(),
            mode: ExecutionMode::default(),
            events: EventDispatcher::new(),
        }
    }
}

impl SessionOptions {
    /// Options from a project's settings, threshold canon and role book,
    /// with the project event log as a notification sink.
    pub fn from_config(config: &KeystoneConfig) -> Result<Self, RunError> {
        let settings = config.load_settings()?;
        let mut events = EventDispatcher::new();
        events.add_sink(Box::new(LogSink::new(&config.events_log)));
        Ok(Self {
            engine: PermissionEngine::new(config.load_roles()?),
            evaluator: ThresholdEvaluator::new(config.load_canon()?),
            retry: RetryPolicy::new(settings.collaborator_max_attempts),
            author: settings.author,
            role: settings.default_role,
            mode: settings.default_mode,
            events,
        })
    }
}

/// Result of `check_integrity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub graph: IntegrityReport,
    /// Entries whose chain was verified.
    pub ledger_entries: usize,
    /// Disagreements between the graph and the hashes the ledger recorded.
    pub mismatches: Vec<String>,
}

impl IntegrityCheck {
    pub fn is_clean(&self) -> bool {
        self.graph.is_clean() && self.mismatches.is_empty()
    }

    /// Every problem found, as display strings.
    pub fn problems(&self) -> Vec<String> {
        self.graph
            .violations
            .iter()
            .map(|v| v.to_string())
            .chain(self.mismatches.iter().cloned())
            .collect()
    }
}

/// A generation call prepared under the session and run without it.
#[derive(Debug, Clone)]
pub struct PendingGeneration {
    pub request: GenerationRequest,
    ledger_mark: usize,
}

/// A metric call prepared under the session and run without it.
#[derive(Debug, Clone)]
pub struct PendingEvaluation {
    pub request: MetricRequest,
    ledger_mark: usize,
}

/// On-disk home of a persistent session.
struct Persistence {
    store: RunStore,
    dir: PathBuf,
    artifacts: ArtifactStore,
}

impl Persistence {
    fn open(store: &RunStore, dir: PathBuf) -> Result<Self, RunError> {
        Ok(Self {
            store: store.clone(),
            artifacts: ArtifactStore::new(RunStore::artifacts_dir(&dir))?,
            dir,
        })
    }
}

/// One run being driven.
pub struct Session {
    run: Run,
    graph: ArtifactGraph,
    ledger: Ledger,
    signals: SignalGateController,
    evaluator: ThresholdEvaluator,
    events: EventDispatcher,
    retry: RetryPolicy,
    author: String,
    persistence: Option<Persistence>,
    dirty: bool,
    /// Appends allowed before every further append fails like a full disk.
    #[cfg(test)]
    appends_before_failure: Option<usize>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("run_id", &self.run.run_id)
            .field("stage", &self.ledger.state().stage)
            .field("artifacts", &self.graph.len())
            .field("entries", &self.ledger.len())
            .finish()
    }
}

impl Session {
    // ── lifecycle ──

    /// Start a run that lives only in memory.
    pub fn in_memory(
        title: &str,
        started_by: &str,
        options: SessionOptions,
    ) -> Result<Self, RunError> {
        let run_id = Uuid::new_v4();
        let (role, mode) = (options.role, options.mode);
        check_start_mode(mode)?;
        let ledger = Ledger::in_memory(run_id, options.engine.clone());
        let run = Run::new(run_id, title, None);
        let mut session = Self::assemble(run, ArtifactGraph::new(run_id), ledger, options, None);
        session.begin(title, started_by, role, mode)?;
        Ok(session)
    }

    /// Start a new persistent run under `store`.
    pub fn start(
        store: &RunStore,
        title: &str,
        started_by: &str,
        options: SessionOptions,
    ) -> Result<Self, RunError> {
        let (role, mode) = (options.role, options.mode);
        check_start_mode(mode)?;
        let run_id = Uuid::new_v4();
        let dir = store.create(run_id)?;
        let ledger_path = RunStore::ledger_path(&dir);
        let ledger = Ledger::open(&ledger_path, run_id, options.engine.clone())?;
        let persistence = Persistence::open(store, dir)?;
        let run = Run::new(run_id, title, Some(ledger_path));

        let mut session = Self::assemble(
            run,
            ArtifactGraph::new(run_id),
            ledger,
            options,
            Some(persistence),
        );
        session.begin(title, started_by, role, mode)?;
        session.save_snapshot()?;
        Ok(session)
    }

    /// Reopen a persistent run, live or archived.
    ///
    /// The ledger is verified and folded, the graph is loaded from the last
    /// snapshot and caught up by replaying the entries written after it, and
    /// the result is checked against the hashes the ledger recorded.
    pub fn resume(
        store: &RunStore,
        run_id: Uuid,
        options: SessionOptions,
    ) -> Result<Self, RunError> {
        let (dir, location) = store.locate(run_id)?;
        let ledger_path = RunStore::ledger_path(&dir);
        let mut ledger = Ledger::open(&ledger_path, run_id, options.engine.clone())?;
        let persistence = Persistence::open(store, dir.clone())?;

        let snapshot = RunStore::load_snapshot(&dir)?;
        let (index, replay_from, mut run) = match snapshot {
            Some(snapshot) => {
                check_snapshot_position(&snapshot, &ledger)?;
                (
                    Some(snapshot.graph),
                    snapshot.ledger_entries as usize,
                    snapshot.run,
                )
            }
            None => {
                let title = match ledger.entries().first().map(|e| &e.payload) {
                    Some(Payload::RunStarted { title, .. }) => title.clone(),
                    _ => return Err(RunError::NotFound(run_id)),
                };
                (None, 0, Run::new(run_id, title, None))
            }
        };

        // A violation found while loading or replaying halts the run the
        // same way as one found by the checks afterwards.
        let rebuilt = rebuild_graph(
            run_id,
            &persistence.artifacts,
            index,
            &ledger.entries()[replay_from..],
        );
        let (graph, problems) = match rebuilt {
            Ok(graph) => {
                let mut problems: Vec<String> = graph
                    .validate_integrity()
                    .violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect();
                problems.extend(reconcile(&graph, ledger.entries()));
                (graph, problems)
            }
            Err(e) if e.kind() == ErrorKind::Integrity => {
                record_integrity_halt(&mut ledger, &[e.to_string()])?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if !problems.is_empty() {
            record_integrity_halt(&mut ledger, &problems)?;
            return Err(RunError::Unrecoverable(problems.join("; ")));
        }

        let signals = SignalGateController::from_ledger(run_id, ledger.entries())?;
        run.ledger_path = Some(ledger_path);
        run.archived = location == RunLocation::Archived;

        let mut session = Self::assemble(run, graph, ledger, options, Some(persistence));
        session.signals = signals;
        session.sync_run();
        session.dirty = replay_from < session.ledger.len();
        tracing::info!(
            run_id = %run_id,
            stage = %session.state().stage,
            replayed = session.ledger.len() - replay_from,
            "run resumed"
        );
        Ok(session)
    }

    fn assemble(
        run: Run,
        graph: ArtifactGraph,
        ledger: Ledger,
        options: SessionOptions,
        persistence: Option<Persistence>,
    ) -> Self {
        let run_id = run.run_id;
        Self {
            run,
            graph,
            ledger,
            signals: SignalGateController::new(run_id),
            evaluator: options.evaluator,
            events: options.events,
            retry: options.retry,
            author: options.author,
            persistence,
            dirty: false,
            #[cfg(test)]
            appends_before_failure: None,
        }
    }

    fn begin(
        &mut self,
        title: &str,
        started_by: &str,
        role: RoleTag,
        mode: ExecutionMode,
    ) -> Result<(), RunError> {
        self.ledger.append(Payload::RunStarted {
            title: title.to_string(),
            role,
            mode,
            started_by: started_by.to_string(),
        })?;
        self.committed();
        tracing::info!(run_id = %self.run.run_id, title, %role, %mode, "run started");
        Ok(())
    }

    // ── accessors ──

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    pub fn state(&self) -> &GovernanceState {
        self.ledger.state()
    }

    pub fn graph(&self) -> &ArtifactGraph {
        &self.graph
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn signals(&self) -> &SignalGateController {
        &self.signals
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Directory of a persistent run.
    pub fn dir(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.dir.as_path())
    }

    /// Changes committed since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ── artifacts ──

    /// Produce a new artifact at the current stage.
    ///
    /// `depends_on` lists `(target, relation)` edges from the new artifact.
    /// The artifact's parent is the most recently registered artifact.
    pub fn produce_artifact(
        &mut self,
        artifact_type: ArtifactType,
        content: impl Into<String>,
        depends_on: &[(ArtifactId, Relation)],
    ) -> Result<ArtifactId, RunError> {
        self.authorize(&ActionRequest::agent(Operation::ArtifactProduce).of_type(artifact_type))?;
        let parent_hash = self.graph.latest().map(|a| a.hash.clone());
        let artifact = self.new_artifact(artifact_type, content.into(), parent_hash);
        self.register(artifact, depends_on, Operation::ArtifactProduce, None)
    }

    /// Replace an artifact with a new one derived from it. The original is
    /// kept; the replacement's parent is the original's hash.
    pub fn supersede_artifact(
        &mut self,
        prior: ArtifactId,
        content: impl Into<String>,
    ) -> Result<ArtifactId, RunError> {
        let (artifact_type, parent_hash) = {
            let old = self.graph.get(prior).ok_or(GraphError::NotFound(prior))?;
            (old.artifact_type, old.hash.clone())
        };
        self.authorize(&ActionRequest::agent(Operation::ArtifactSupersede).of_type(artifact_type))?;
        let artifact = self.new_artifact(artifact_type, content.into(), Some(parent_hash));
        self.register(
            artifact,
            &[(prior, Relation::DerivedFrom)],
            Operation::ArtifactSupersede,
            Some(prior),
        )
    }

    /// Revise the scope statement. Only legal before the baseline is
    /// frozen, or while a micro-adjustment is in progress.
    pub fn change_scope(&mut self, content: impl Into<String>) -> Result<ArtifactId, RunError> {
        self.authorize(&ActionRequest::agent(Operation::ScopeChange))?;
        let current = self
            .graph
            .latest_of_type(ArtifactType::ScopeStatement)
            .map(|a| (a.artifact_id, a.hash.clone()));
        let (depends_on, supersedes, parent_hash) = match current {
            Some((id, hash)) => (vec![(id, Relation::DerivedFrom)], Some(id), Some(hash)),
            None => (vec![], None, self.graph.latest().map(|a| a.hash.clone())),
        };
        let artifact = self.new_artifact(ArtifactType::ScopeStatement, content.into(), parent_hash);
        self.register(artifact, &depends_on, Operation::ScopeChange, supersedes)
    }

    /// Replace the body of a mutable artifact.
    pub fn edit_artifact(
        &mut self,
        id: ArtifactId,
        content: impl Into<String>,
    ) -> Result<String, RunError> {
        let (frozen, prior_hash) = {
            let artifact = self.graph.get(id).ok_or(GraphError::NotFound(id))?;
            (artifact.is_immutable, artifact.hash.clone())
        };
        self.authorize(&ActionRequest::agent(Operation::ArtifactEdit).on_frozen(frozen))?;

        let before = self.graph.clone();
        let hash = self.graph.update_content(id, content)?;
        let payload = Payload::ArtifactEdited {
            artifact_id: id,
            prior_hash,
            hash: hash.clone(),
        };
        if let Err(e) = self.save_envelopes(&[id]).and_then(|_| self.append(payload)) {
            self.graph = before;
            self.restore_envelopes(&[id]);
            return Err(e);
        }
        self.committed();
        tracing::info!(artifact_id = %id, hash = %hash, "artifact edited");
        Ok(hash)
    }

    /// Set a metadata annotation; legal on frozen artifacts too.
    pub fn annotate_artifact(
        &mut self,
        id: ArtifactId,
        key: &str,
        value: &str,
    ) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::ArtifactAnnotate))?;
        let before = self.graph.clone();
        self.graph.annotate(id, key, value)?;
        let payload = Payload::ArtifactAnnotated {
            artifact_id: id,
            key: key.to_string(),
            value: value.to_string(),
        };
        if let Err(e) = self.append(payload) {
            self.graph = before;
            return Err(e);
        }
        self.committed();
        Ok(())
    }

    /// Add a dependency edge `from -> to`.
    pub fn link_artifacts(
        &mut self,
        from: ArtifactId,
        to: ArtifactId,
        relation: Relation,
    ) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::GraphLink))?;
        let checkpoint = self.graph.checkpoint();
        self.graph.add_edge(from, to, relation)?;
        let payload = Payload::EdgeAdded { from, to, relation };
        if let Err(e) = self.save_envelopes(&[from]).and_then(|_| self.append(payload)) {
            self.graph.rollback(checkpoint);
            self.restore_envelopes(&[from]);
            return Err(e);
        }
        self.committed();
        tracing::info!(from = %from, to = %to, %relation, "artifacts linked");
        Ok(())
    }

    fn new_artifact(
        &self,
        artifact_type: ArtifactType,
        content: String,
        parent_hash: Option<String>,
    ) -> Artifact {
        let state = self.ledger.state();
        Artifact::new(
            self.run.run_id,
            artifact_type,
            state.stage.index(),
            content,
            parent_hash,
            &self.author,
            state.role.name(),
        )
    }

    /// Register an artifact and its edges, write its envelope, then record
    /// it. All-or-nothing.
    fn register(
        &mut self,
        artifact: Artifact,
        depends_on: &[(ArtifactId, Relation)],
        operation: Operation,
        supersedes: Option<ArtifactId>,
    ) -> Result<ArtifactId, RunError> {
        let id = artifact.artifact_id;
        let payload = Payload::ArtifactRegistered {
            artifact_id: id,
            artifact_type: artifact.artifact_type,
            hash: artifact.hash.clone(),
            parent_hash: artifact.parent_hash.clone(),
            operation,
            supersedes,
        };

        let checkpoint = self.graph.checkpoint();
        let staged = self.graph.register(artifact).map_err(RunError::from).and_then(|_| {
            depends_on
                .iter()
                .try_for_each(|&(to, relation)| self.graph.add_edge(id, to, relation))
                .map_err(RunError::from)
        });
        let result = staged
            .and_then(|_| self.save_envelopes(&[id]))
            .and_then(|_| self.append(payload));
        if let Err(e) = result {
            // An envelope left behind is never named by the ledger or a
            // snapshot, so it is ignored on resume.
            self.graph.rollback(checkpoint);
            return Err(e);
        }

        let signal = self.record_follow_up(SignalType::ArtifactProduced, vec![id], None);
        self.committed();
        tracing::info!(
            artifact_id = %id,
            %operation,
            signal_id = ?signal.map(|s| s.signal_id),
            "artifact registered"
        );
        Ok(id)
    }

    // ── metrics ──

    /// Band metric results and record the snapshot. A result in the halt
    /// band halts the run; the report is still returned.
    pub fn evaluate_metrics(&mut self, results: &[MetricResult]) -> Result<MetricReport, RunError> {
        self.authorize(&ActionRequest::agent(Operation::MetricEvaluate))?;
        let report = self
            .evaluator
            .evaluate(results)?
            .with_prior_streak(self.ledger.state().warning_streak);

        self.append(Payload::MetricSnapshot {
            report: report.clone(),
        })?;
        self.record_follow_up(SignalType::MetricRecorded, vec![], Some(report.clone()));
        self.committed();

        tracing::info!(
            run_id = %self.run.run_id,
            overall = ?report.overall,
            halted = report.halted,
            warning_streak = report.warning_streak,
            "metric snapshot recorded"
        );
        if let Some(halt) = self.ledger.state().halt.as_ref().filter(|_| report.halted) {
            tracing::warn!(run_id = %self.run.run_id, reason = %halt.reason, "run halted by metric");
            self.dispatch(KsEvent::halt_raised(
                self.run.run_id,
                HaltSource::Metric,
                &halt.reason,
            ));
        }
        Ok(report)
    }

    /// Build a scoring request for the artifacts of the current stage.
    pub fn prepare_evaluation(&self) -> Result<PendingEvaluation, RunError> {
        self.authorize(&ActionRequest::agent(Operation::MetricEvaluate))?;
        let stage = self.ledger.state().stage;
        let artifacts = self
            .graph
            .produced_at_stage(stage.index())
            .into_iter()
            .filter_map(|id| self.graph.get(id).map(|a| (id, a.content.clone())))
            .collect();
        Ok(PendingEvaluation {
            request: MetricRequest {
                run_id: self.run.run_id,
                stage,
                artifacts,
                context: self.context_projection(),
            },
            ledger_mark: self.ledger.len(),
        })
    }

    /// Record the results of a scoring call, unless the run was halted
    /// while it was in flight.
    pub fn finish_evaluation(
        &mut self,
        pending: PendingEvaluation,
        results: Vec<MetricResult>,
    ) -> Result<MetricReport, RunError> {
        if let Some(reason) = self.halted_since(pending.ledger_mark) {
            tracing::warn!(run_id = %self.run.run_id, %reason, "discarding metric results");
            return Err(RunError::Discarded(format!(
                "metric results arrived after a halt: {}",
                reason
            )));
        }
        self.evaluate_metrics(&results)
    }

    /// Score the current stage with an external service.
    pub fn evaluate_with_service(
        &mut self,
        service: &dyn MetricService,
    ) -> Result<MetricReport, RunError> {
        let pending = self.prepare_evaluation()?;
        let results = self.retry.run(|_| service.evaluate(&pending.request))?;
        self.finish_evaluation(pending, results)
    }

    // ── generation ──

    /// Build a generation request carrying the active role's constraints.
    pub fn prepare_generation(
        &self,
        artifact_type: ArtifactType,
        instruction: &str,
    ) -> Result<PendingGeneration, RunError> {
        self.authorize(&ActionRequest::agent(Operation::GenerationRequest))?;
        self.authorize(&ActionRequest::agent(Operation::ArtifactProduce).of_type(artifact_type))?;
        let state = self.ledger.state();
        let constraints = self
            .ledger
            .engine()
            .roles()
            .get(state.role)
            .constraint_block();
        Ok(PendingGeneration {
            request: GenerationRequest {
                run_id: self.run.run_id,
                stage: state.stage,
                role: state.role,
                artifact_type,
                instruction: instruction.to_string(),
                constraints,
                context: self.context_projection(),
            },
            ledger_mark: self.ledger.len(),
        })
    }

    /// Turn generated content into an artifact. The production is proposed
    /// again against the current state; content that arrives after a halt
    /// is discarded.
    pub fn finish_generation(
        &mut self,
        pending: PendingGeneration,
        content: String,
    ) -> Result<ArtifactId, RunError> {
        if let Some(reason) = self.halted_since(pending.ledger_mark) {
            tracing::warn!(
                run_id = %self.run.run_id,
                artifact_type = %pending.request.artifact_type,
                %reason,
                "discarding generated content"
            );
            return Err(RunError::Discarded(format!(
                "{} generated after a halt: {}",
                pending.request.artifact_type, reason
            )));
        }
        self.produce_artifact(pending.request.artifact_type, content, &[])
    }

    /// Generate an artifact with an external service.
    pub fn generate(
        &mut self,
        service: &dyn GenerationService,
        artifact_type: ArtifactType,
        instruction: &str,
    ) -> Result<ArtifactId, RunError> {
        let pending = self.prepare_generation(artifact_type, instruction)?;
        let content = self.retry.run(|_| service.generate(&pending.request))?;
        self.finish_generation(pending, content)
    }

    /// Reason for a halt recorded at or after ledger position `mark`, or
    /// for the halt currently in force.
    fn halted_since(&self, mark: usize) -> Option<String> {
        if let Some(halt) = &self.ledger.state().halt {
            return Some(halt.reason.clone());
        }
        let entries = self.ledger.entries();
        entries[mark.min(entries.len())..]
            .iter()
            .find_map(|e| match &e.payload {
                Payload::HaltRaised { reason, .. } => Some(reason.clone()),
                Payload::MetricSnapshot { report } if report.halted => {
                    Some("metric halt band".to_string())
                }
                _ => None,
            })
    }

    // ── signals and gates ──

    /// Ask to move to the next stage: emit the gated signal out of the
    /// current stage. The run then waits for `resolve_gate`.
    pub fn propose_advance(&mut self) -> Result<Signal, RunError> {
        let stage = self.ledger.state().stage;
        let next = stage
            .next()
            .ok_or(RunError::Denied(DenialReason::TerminalStage { stage }))?;
        self.authorize(&ActionRequest::agent(Operation::SignalPropose).to_stage(next))?;
        let signal_type =
            SignalType::gate_for(stage).ok_or(RunError::Denied(DenialReason::TerminalStage { stage }))?;

        let artifacts = self.graph.produced_at_stage(stage.index());
        let metrics = self.ledger.latest_metric_report().cloned();
        let signal = self.record_signal(signal_type, artifacts, metrics)?;
        self.committed();

        tracing::info!(
            run_id = %self.run.run_id,
            signal_id = %signal.signal_id,
            %signal_type,
            "gate opened"
        );
        self.dispatch(KsEvent::GateOpened {
            run_id: self.run.run_id,
            signal_id: signal.signal_id,
            signal_type: signal_type.to_string(),
            stage_from: stage,
            stage_to: next,
            timestamp: Utc::now(),
        });
        Ok(signal)
    }

    /// Send a free-form notice to the notification sinks.
    pub fn notify(&self, message: &str) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::SignalNotify))?;
        self.dispatch(KsEvent::Notice {
            run_id: self.run.run_id,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Record a human decision on the pending gate.
    ///
    /// Approval checkpoints the stage being left: every artifact produced
    /// in it is frozen. Rejection leaves the stage and the artifacts as
    /// they are.
    pub fn resolve_gate(
        &mut self,
        decision: GateDecision,
        identity: &str,
        note: Option<String>,
    ) -> Result<Signal, RunError> {
        self.authorize(&ActionRequest::human(Operation::GateResolve, identity))?;
        let (signal_id, stage_from) = {
            let pending = self
                .signals
                .pending()
                .ok_or(RunError::Denied(DenialReason::NoPendingGate))?;
            (pending.signal_id, pending.stage_from)
        };

        let before = self.graph.clone();
        let frozen = match decision {
            GateDecision::Approve => self.graph.freeze_stage(stage_from.index())?,
            GateDecision::Reject => Vec::new(),
        };
        let mut signals = self.signals.clone();
        let result = signals
            .resolve(signal_id, decision, identity, frozen.clone(), note)
            .and_then(|payload| {
                self.save_envelopes(&frozen)?;
                self.append(payload)
            });
        if let Err(e) = result {
            self.graph = before;
            self.restore_envelopes(&frozen);
            return Err(e);
        }
        self.signals = signals;
        self.committed();

        tracing::info!(
            run_id = %self.run.run_id,
            %signal_id,
            %decision,
            identity,
            frozen = frozen.len(),
            "gate resolved"
        );
        self.dispatch(KsEvent::GateResolved {
            run_id: self.run.run_id,
            signal_id,
            decision,
            identity: identity.to_string(),
            timestamp: Utc::now(),
        });
        self.signals
            .get(signal_id)
            .cloned()
            .ok_or(RunError::UnknownSignal(signal_id))
    }

    /// Move to the stage an approved gate leads to.
    ///
    /// Leaving the baseline stage freezes the baseline first if that has
    /// not happened yet. Advancing from reporting closes and archives the
    /// run.
    pub fn advance_stage(&mut self) -> Result<Stage, RunError> {
        let (from, needs_freeze) = {
            let state = self.ledger.state();
            let needs_freeze = state.stage == Stage::Baseline
                && !state.baseline_frozen
                && state.approved_gate.is_some();
            (state.stage, needs_freeze)
        };
        let next = from
            .next()
            .ok_or(RunError::Denied(DenialReason::TerminalStage { stage: from }))?;
        if next == Stage::Closure {
            self.close_run()?;
            return Ok(Stage::Closure);
        }
        if needs_freeze {
            self.freeze_baseline()?;
        }

        self.authorize(&ActionRequest::agent(Operation::StageAdvance).to_stage(next))?;
        let signal_id = self
            .ledger
            .state()
            .approved_gate
            .as_ref()
            .map(|g| g.signal_id)
            .ok_or(RunError::Denied(DenialReason::NoApprovedGate {
                operation: Operation::StageAdvance,
            }))?;
        self.append(Payload::StageAdvanced {
            signal_id,
            from,
            to: next,
        })?;
        self.committed();

        tracing::info!(run_id = %self.run.run_id, %from, to = %next, "stage advanced");
        self.dispatch(KsEvent::stage_advanced(self.run.run_id, from, next));
        Ok(next)
    }

    /// Freeze every artifact and mark the baseline frozen.
    pub fn freeze_baseline(&mut self) -> Result<Vec<ArtifactId>, RunError> {
        self.authorize(&ActionRequest::agent(Operation::BaselineFreeze))?;
        let before = self.graph.clone();
        let frozen = self.graph.freeze_all()?;
        let payload = Payload::BaselineFrozen {
            artifact_ids: frozen.clone(),
        };
        if let Err(e) = self.save_envelopes(&frozen).and_then(|_| self.append(payload)) {
            self.graph = before;
            self.restore_envelopes(&frozen);
            return Err(e);
        }
        self.committed();
        tracing::info!(run_id = %self.run.run_id, frozen = frozen.len(), "baseline frozen");
        Ok(frozen)
    }

    /// Close the run after the closure gate was approved, then archive it.
    pub fn close_run(&mut self) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::RunClose))?;
        self.append(Payload::RunClosed {
            outcome: RunOutcome::Completed,
        })?;
        self.finish(RunOutcome::Completed)
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<(), RunError> {
        self.committed();
        tracing::info!(run_id = %self.run.run_id, ?outcome, "run closed");
        self.dispatch(KsEvent::RunClosed {
            run_id: self.run.run_id,
            outcome,
            timestamp: Utc::now(),
        });
        self.archive()
    }

    fn archive(&mut self) -> Result<(), RunError> {
        if self.persistence.is_none() {
            return Ok(());
        }
        self.save_snapshot()?;
        if let Some(p) = self.persistence.as_mut() {
            let dir = p.store.archive(self.run.run_id)?;
            p.artifacts = ArtifactStore::new(RunStore::artifacts_dir(&dir))?;
            self.run.ledger_path = Some(RunStore::ledger_path(&dir));
            p.dir = dir;
        }
        self.run.archived = true;
        self.save_snapshot()?;
        Ok(())
    }

    // ── scope ──

    /// Jump back to an earlier stage (at most baseline) to correct it.
    /// The run enters replay mode until `replay_forward` returns it to the
    /// stage it left.
    pub fn micro_adjust(
        &mut self,
        target: Stage,
        identity: &str,
        reason: &str,
    ) -> Result<(), RunError> {
        self.authorize(&ActionRequest::human(Operation::ScopeAdjust, identity).to_stage(target))?;
        let origin = self.ledger.state().stage;
        self.append(Payload::ScopeAdjusted {
            origin,
            target,
            identity: identity.to_string(),
            reason: reason.to_string(),
        })?;
        self.committed();
        tracing::info!(run_id = %self.run.run_id, %origin, %target, identity, "scope adjustment started");
        Ok(())
    }

    /// Walk back to the adjustment's origin, one recorded replay per
    /// stage, and restore the mode the run had before. Returns the stage
    /// reached.
    pub fn replay_forward(&mut self) -> Result<Stage, RunError> {
        if self.ledger.state().adjustment.is_none() {
            return Err(RunError::Denied(DenialReason::NoAdjustment));
        }
        while self.ledger.state().adjustment.is_some() {
            let from = self.ledger.state().stage;
            let to = from
                .next()
                .ok_or(RunError::Denied(DenialReason::TerminalStage { stage: from }))?;
            self.authorize(&ActionRequest::agent(Operation::StageReplay).to_stage(to))?;
            self.append(Payload::StageReplayed { from, to })?;
            self.committed();
            tracing::info!(run_id = %self.run.run_id, %from, %to, "stage replayed");
        }
        Ok(self.ledger.state().stage)
    }

    /// Flag scope drift. The run pauses until `resolve_drift`.
    pub fn report_drift(&mut self, reason: &str) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::DriftReport))?;
        self.append(Payload::DriftDetected {
            reason: reason.to_string(),
        })?;
        self.record_follow_up(SignalType::DriftDetected, vec![], None);
        self.committed();
        tracing::warn!(run_id = %self.run.run_id, reason, "scope drift reported, run paused");
        self.dispatch(KsEvent::RunPaused {
            run_id: self.run.run_id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn resolve_drift(
        &mut self,
        choice: DriftChoice,
        identity: &str,
        note: Option<String>,
    ) -> Result<(), RunError> {
        self.authorize(
            &ActionRequest::human(Operation::DriftResolve, identity).with_drift_choice(choice),
        )?;
        self.append(Payload::DriftResolved {
            choice,
            identity: identity.to_string(),
            note,
        })?;
        self.committed();
        tracing::info!(run_id = %self.run.run_id, ?choice, identity, "drift resolved");
        Ok(())
    }

    // ── halts ──

    /// Stop all automated work until a human resolves the halt.
    pub fn halt_immediate(&mut self, reason: &str) -> Result<(), RunError> {
        self.authorize(&ActionRequest::agent(Operation::HaltImmediate))?;
        self.raise_halt(HaltSource::Manual, reason)
    }

    fn raise_halt(&mut self, source: HaltSource, reason: &str) -> Result<(), RunError> {
        self.append(Payload::HaltRaised {
            source,
            reason: reason.to_string(),
        })?;
        self.committed();
        tracing::warn!(run_id = %self.run.run_id, %source, reason, "run halted");
        self.dispatch(KsEvent::halt_raised(self.run.run_id, source, reason));
        Ok(())
    }

    /// Resume the halted run, or abandon it (which closes and archives it).
    pub fn resolve_halt(
        &mut self,
        choice: HaltChoice,
        identity: &str,
        note: Option<String>,
    ) -> Result<(), RunError> {
        self.authorize(&ActionRequest::human(Operation::HaltResolve, identity))?;
        self.append(Payload::HaltResolved {
            choice,
            identity: identity.to_string(),
            note,
        })?;
        tracing::info!(run_id = %self.run.run_id, ?choice, identity, "halt resolved");
        match choice {
            HaltChoice::Resume => {
                self.committed();
                Ok(())
            }
            HaltChoice::Abandon => self.finish(RunOutcome::Abandoned),
        }
    }

    // ── role and mode ──

    pub fn switch_role(&mut self, role: RoleTag, identity: &str) -> Result<(), RunError> {
        self.authorize(&ActionRequest::human(Operation::RoleSwitch, identity))?;
        let from = self.ledger.state().role;
        self.append(Payload::RoleSwitched {
            from,
            to: role,
            identity: identity.to_string(),
        })?;
        self.committed();
        tracing::info!(run_id = %self.run.run_id, %from, to = %role, identity, "role switched");
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ExecutionMode, identity: &str) -> Result<(), RunError> {
        self.authorize(&ActionRequest::human(Operation::ModeSet, identity).to_mode(mode))?;
        let from = self.ledger.state().mode;
        self.append(Payload::ModeSet {
            from,
            to: mode,
            identity: identity.to_string(),
        })?;
        self.committed();
        tracing::info!(run_id = %self.run.run_id, %from, to = %mode, identity, "mode set");
        Ok(())
    }

    // ── integrity and views ──

    /// Verify the ledger chain, scan the graph and compare it with the
    /// hashes the ledger recorded.
    ///
    /// On an open run the check is recorded; any problem found also halts
    /// the run. A broken ledger chain is returned as an error since nothing
    /// can be appended to it.
    pub fn check_integrity(&mut self) -> Result<IntegrityCheck, RunError> {
        self.authorize(&ActionRequest::agent(Operation::IntegrityValidate))?;
        self.ledger.verify_chain()?;
        self.signals.verify_chain()?;

        let check = IntegrityCheck {
            graph: self.graph.validate_integrity(),
            ledger_entries: self.ledger.len(),
            mismatches: reconcile(&self.graph, self.ledger.entries()),
        };
        if self.ledger.state().closed {
            return Ok(check);
        }

        let problems = check.problems();
        self.append(Payload::IntegrityChecked {
            artifacts_checked: check.graph.artifacts_checked,
            edges_checked: check.graph.edges_checked,
            violations: problems.clone(),
        })?;
        self.committed();
        if let Some(first) = problems.first() {
            if !self.ledger.state().is_halted() {
                self.raise_halt(HaltSource::Integrity, first)?;
            }
        }
        Ok(check)
    }

    /// The one-line context string for the current committed state.
    pub fn context_projection(&self) -> String {
        projection::context_line(self.ledger.state(), self.ledger.latest_metric_report())
    }

    /// Point-in-time snapshot of everything the ledger does not hold.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.run.clone(),
            graph: self.graph.index(),
            ledger_entries: self.ledger.len() as u64,
            ledger_head: self.ledger.last_hash().map(str::to_string),
            saved_at: Utc::now(),
        }
    }

    /// Write the snapshot. Returns `false` for an in-memory session.
    pub fn save_snapshot(&mut self) -> Result<bool, RunError> {
        let Some(p) = self.persistence.as_ref() else {
            return Ok(false);
        };
        RunStore::save_snapshot(&p.dir, &self.snapshot())?;
        self.dirty = false;
        tracing::debug!(run_id = %self.run.run_id, entries = self.ledger.len(), "snapshot saved");
        Ok(true)
    }

    /// Write the snapshot only if something was committed since the last one.
    pub fn autosave(&mut self) -> Result<bool, RunError> {
        if !self.dirty {
            return Ok(false);
        }
        self.save_snapshot()
    }

    // ── internals ──

    fn authorize(&self, request: &ActionRequest) -> Result<(), RunError> {
        self.ledger
            .propose(request)
            .into_result()
            .map_err(RunError::Denied)
    }

    fn append(&mut self, payload: Payload) -> Result<LedgerEntry, RunError> {
        #[cfg(test)]
        if let Some(remaining) = self.appends_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(RunError::Ledger(ks_audit::LedgerError::WriteFailed {
                    path: PathBuf::from("ledger.jsonl"),
                    source: std::io::Error::other("no space left on device"),
                }));
            }
            *remaining -= 1;
        }
        Ok(self.ledger.append(payload)?)
    }

    /// Emit a signal and record it; the controller only moves if the
    /// ledger accepted the entry.
    fn record_signal(
        &mut self,
        signal_type: SignalType,
        artifacts: Vec<ArtifactId>,
        metrics: Option<MetricReport>,
    ) -> Result<Signal, RunError> {
        let mut signals = self.signals.clone();
        let signal = signals.emit(signal_type, self.ledger.state().stage, artifacts, metrics)?;
        self.append(signal.to_payload())?;
        self.signals = signals;
        Ok(signal)
    }

    /// Record the informational signal for an entry that is already
    /// committed. Failing here leaves that entry in force.
    fn record_follow_up(
        &mut self,
        signal_type: SignalType,
        artifacts: Vec<ArtifactId>,
        metrics: Option<MetricReport>,
    ) -> Option<Signal> {
        match self.record_signal(signal_type, artifacts, metrics) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run.run_id,
                    %signal_type,
                    error = %e,
                    "informational signal not recorded"
                );
                None
            }
        }
    }

    fn committed(&mut self) {
        self.sync_run();
        self.dirty = true;
    }

    fn sync_run(&mut self) {
        let artifact_ids = self.graph.artifacts().map(|a| a.artifact_id).collect();
        let signal_ids = self.signals.signals().iter().map(|s| s.signal_id).collect();
        self.run.sync(self.ledger.state(), artifact_ids, signal_ids);
    }

    fn dispatch(&self, event: KsEvent) {
        self.events.dispatch(&event);
    }

    /// Write the envelopes of `ids` as they are in the graph now.
    fn save_envelopes(&self, ids: &[ArtifactId]) -> Result<(), RunError> {
        let Some(p) = self.persistence.as_ref() else {
            return Ok(());
        };
        for &id in ids {
            let artifact = self.graph.get(id).ok_or(GraphError::NotFound(id))?;
            let dependencies = self
                .graph
                .edges_from(id)?
                .into_iter()
                .map(|e| DependencyRef {
                    target: e.to,
                    relation: e.relation,
                })
                .collect();
            p.artifacts.save(artifact, dependencies)?;
        }
        Ok(())
    }

    /// Best-effort rewrite of envelopes after a rollback.
    fn restore_envelopes(&self, ids: &[ArtifactId]) {
        if let Err(e) = self.save_envelopes(ids) {
            tracing::warn!(run_id = %self.run.run_id, error = %e, "could not restore envelopes after rollback");
        }
    }
}

fn check_start_mode(mode: ExecutionMode) -> Result<(), RunError> {
    if mode == ExecutionMode::Replay {
        return Err(RunError::Denied(DenialReason::ReplayModeReserved));
    }
    Ok(())
}

/// The snapshot must describe a prefix of the ledger.
fn check_snapshot_position(snapshot: &RunSnapshot, ledger: &Ledger) -> Result<(), RunError> {
    let count = snapshot.ledger_entries as usize;
    if count > ledger.len() {
        return Err(RunError::Unrecoverable(format!(
            "snapshot covers {} entries but the ledger has {}",
            count,
            ledger.len()
        )));
    }
    let head = count
        .checked_sub(1)
        .and_then(|i| ledger.entries().get(i))
        .map(|e| e.hash.as_str());
    if head != snapshot.ledger_head.as_deref() {
        return Err(RunError::Unrecoverable(format!(
            "snapshot head does not match ledger entry #{}",
            count
        )));
    }
    Ok(())
}

/// Load the snapshot's graph (or an empty one) and replay `entries` onto it.
fn rebuild_graph(
    run_id: Uuid,
    artifacts: &ArtifactStore,
    index: Option<GraphIndex>,
    entries: &[LedgerEntry],
) -> Result<ArtifactGraph, RunError> {
    let mut graph = match index {
        Some(index) => artifacts.load_graph(index)?,
        None => ArtifactGraph::new(run_id),
    };
    for entry in entries {
        replay_entry(&mut graph, artifacts, entry)?;
    }
    Ok(graph)
}

/// Record an integrity halt for a run that failed to resume, unless it is
/// closed or already halted.
fn record_integrity_halt(ledger: &mut Ledger, problems: &[String]) -> Result<(), RunError> {
    tracing::warn!(run_id = %ledger.run_id(), problems = ?problems, "run failed integrity check on resume");
    let state = ledger.state();
    if state.closed || state.is_halted() {
        return Ok(());
    }
    let reason = problems.first().cloned().unwrap_or_default();
    ledger.append(Payload::HaltRaised {
        source: HaltSource::Integrity,
        reason,
    })?;
    Ok(())
}

/// Re-apply one committed entry to a graph loaded from an older snapshot.
fn replay_entry(
    graph: &mut ArtifactGraph,
    artifacts: &ArtifactStore,
    entry: &LedgerEntry,
) -> Result<(), RunError> {
    match &entry.payload {
        Payload::ArtifactRegistered { artifact_id, .. } => {
            if graph.contains(*artifact_id) {
                return Ok(());
            }
            let (artifact, dependencies) = artifacts.load(*artifact_id)?;
            graph.register(artifact)?;
            // Edges to later artifacts arrive with their own edge entries.
            let known: Vec<DependencyRef> = dependencies
                .into_iter()
                .filter(|d| graph.contains(d.target))
                .collect();
            for dep in known {
                link_once(graph, *artifact_id, dep.target, dep.relation)?;
            }
        }
        Payload::ArtifactEdited { artifact_id, .. } => {
            let (stored, _) = artifacts.load(*artifact_id)?;
            let current = graph
                .get(*artifact_id)
                .ok_or(GraphError::NotFound(*artifact_id))?;
            if current.hash != stored.hash {
                graph.update_content(*artifact_id, stored.content)?;
            }
        }
        Payload::ArtifactAnnotated {
            artifact_id,
            key,
            value,
        } => graph.annotate(*artifact_id, key.as_str(), value.as_str())?,
        Payload::EdgeAdded { from, to, relation } => link_once(graph, *from, *to, *relation)?,
        Payload::BaselineFrozen { artifact_ids } => {
            for id in artifact_ids {
                graph.freeze(*id)?;
            }
        }
        Payload::GateResolved { frozen, .. } => {
            for id in frozen {
                graph.freeze(*id)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn link_once(
    graph: &mut ArtifactGraph,
    from: ArtifactId,
    to: ArtifactId,
    relation: Relation,
) -> Result<(), GraphError> {
    match graph.add_edge(from, to, relation) {
        Ok(()) | Err(GraphError::DuplicateEdge { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Compare each artifact's hash with the last hash the ledger recorded for
/// it (registration or edit).
fn reconcile(graph: &ArtifactGraph, entries: &[LedgerEntry]) -> Vec<String> {
    let mut recorded: BTreeMap<ArtifactId, &str> = BTreeMap::new();
    for entry in entries {
        match &entry.payload {
            Payload::ArtifactRegistered {
                artifact_id, hash, ..
            }
            | Payload::ArtifactEdited {
                artifact_id, hash, ..
            } => {
                recorded.insert(*artifact_id, hash.as_str());
            }
            _ => {}
        }
    }

    let mut problems = Vec::new();
    for artifact in graph.artifacts() {
        match recorded.remove(&artifact.artifact_id) {
            Some(hash) if hash == artifact.hash => {}
            Some(hash) => problems.push(format!(
                "artifact {} hashes to {}, ledger recorded {}",
                artifact.artifact_id, artifact.hash, hash
            )),
            None => problems.push(format!(
                "artifact {} is not recorded in the ledger",
                artifact.artifact_id
            )),
        }
    }
    for id in recorded.keys() {
        problems.push(format!("artifact {} recorded in the ledger is missing", id));
    }
    problems
}
