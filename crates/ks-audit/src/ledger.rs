// ledger.rs — Append-only, hash-chained JSONL ledger of one run.
//
// The ledger is the single authority over a run's governance state: every
// transition is proposed against the permission engine, and only what is
// appended here becomes true. Each line is one `LedgerEntry`; each entry
// carries the hash of the one before it, so inserting, deleting or editing
// a line is detected on the next open.
//
// Appends are all-or-nothing: the entry is written, flushed and synced
// before the in-memory state moves. If the write fails the file is cut back
// to its previous length and the state is untouched.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ks_metrics::MetricReport;
use ks_policy::{
    ActionRequest, Decision, EvaluationTrace, GateDecision, GovernanceState, PermissionEngine,
    RunOutcome, Stage,
};
use uuid::Uuid;

use crate::entry::{LedgerEntry, Payload};
use crate::error::LedgerError;
use crate::fold;

/// The ledger of one run.
///
/// `file` is `None` for an in-memory ledger (tests, dry runs).
pub struct Ledger {
    run_id: Uuid,
    engine: PermissionEngine,
    file: Option<File>,
    path: Option<PathBuf>,
    entries: Vec<LedgerEntry>,
    state: GovernanceState,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("run_id", &self.run_id)
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Ledger {
    /// A ledger that lives only in memory.
    pub fn in_memory(run_id: Uuid, engine: PermissionEngine) -> Self {
        Self {
            run_id,
            engine,
            file: None,
            path: None,
            entries: Vec::new(),
            state: GovernanceState::new(run_id),
        }
    }

    /// Open (or create) the ledger file for `run_id`.
    ///
    /// Existing entries are parsed, their chain verified and folded into the
    /// governance state. A torn final line (no trailing newline, not valid
    /// JSON) is the remains of an interrupted append and is truncated. Any
    /// other damage is refused as an integrity violation.
    pub fn open(
        path: impl AsRef<Path>,
        run_id: Uuid,
        engine: PermissionEngine,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |source| LedgerError::OpenFailed {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(open_failed)?;
            }
        }

        let entries = if path.exists() {
            let text = fs::read_to_string(&path).map_err(open_failed)?;
            let (entries, keep) = parse_lines(&text)?;
            if keep < text.len() {
                tracing::warn!(
                    path = %path.display(),
                    dropped_bytes = text.len() - keep,
                    "truncating torn ledger tail"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(open_failed)?;
                file.set_len(keep as u64).map_err(open_failed)?;
                file.sync_data().map_err(open_failed)?;
            }
            entries
        } else {
            Vec::new()
        };

        verify_entries(&entries, Some(run_id))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_failed)?;

        let state = fold::fold(run_id, &entries);
        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            stage = %state.stage,
            "ledger opened"
        );

        Ok(Self {
            run_id,
            engine,
            file: Some(file),
            path: Some(path),
            entries,
            state,
        })
    }

    /// Rule on a request against the current state. Never has side effects.
    pub fn propose(&self, request: &ActionRequest) -> Decision {
        let decision = self.engine.evaluate(&self.state, request);
        if let Decision::Deny(reason) = &decision {
            tracing::info!(
                run_id = %self.run_id,
                operation = %request.operation,
                %reason,
                "request denied"
            );
        }
        decision
    }

    /// Like [`propose`](Self::propose) but with every check recorded.
    pub fn propose_with_trace(&self, request: &ActionRequest) -> EvaluationTrace {
        self.engine.evaluate_with_trace(&self.state, request)
    }

    /// Append a sealed entry for `payload` and fold it into the state.
    pub fn append(&mut self, payload: Payload) -> Result<LedgerEntry, LedgerError> {
        self.check_structure(&payload)?;

        let entry = LedgerEntry::seal(
            self.run_id,
            self.entries.len() as u64,
            self.state.stage,
            self.state.role,
            payload,
            self.last_hash().map(str::to_string),
        )?;

        if let (Some(file), Some(path)) = (self.file.as_mut(), self.path.as_ref()) {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            write_line(file, path, line.as_bytes())?;
        }

        fold::apply(&mut self.state, &entry);
        tracing::debug!(
            run_id = %self.run_id,
            seq = entry.seq,
            kind = entry.payload.kind(),
            "ledger entry appended"
        );
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Rules that hold for the ledger regardless of who asks.
    fn check_structure(&self, payload: &Payload) -> Result<(), LedgerError> {
        let state = &self.state;
        let refuse = |reason: String| LedgerError::InvalidEntry {
            kind: payload.kind().to_string(),
            reason,
        };

        if state.closed {
            return Err(LedgerError::Closed);
        }
        match (self.entries.is_empty(), payload) {
            (true, Payload::RunStarted { .. }) => return Ok(()),
            (true, _) => return Err(refuse("the first entry must be run_started".into())),
            (false, Payload::RunStarted { .. }) => {
                return Err(refuse("run already started".into()))
            }
            _ => {}
        }

        match payload {
            Payload::SignalEmitted {
                gated: true,
                stage_from,
                stage_to,
                ..
            } => {
                if let Some(pending) = &state.pending_gate {
                    return Err(refuse(format!(
                        "gate {} is still pending",
                        pending.signal_type
                    )));
                }
                if *stage_from != state.stage || *stage_to != state.stage.next() {
                    return Err(refuse(format!(
                        "gated signal must lead from {} to the next stage",
                        state.stage
                    )));
                }
            }
            Payload::GateResolved { signal_id, .. } => match &state.pending_gate {
                Some(pending) if pending.signal_id == *signal_id => {}
                _ => return Err(refuse(format!("no pending gate for signal {}", signal_id))),
            },
            Payload::StageAdvanced {
                signal_id,
                from,
                to,
            } => match &state.approved_gate {
                Some(gate)
                    if gate.signal_id == *signal_id
                        && gate.stage_to == *to
                        && *from == state.stage => {}
                _ => {
                    return Err(refuse(format!(
                        "no approved gate for {} -> {}",
                        from, to
                    )))
                }
            },
            Payload::StageReplayed { from, to } => {
                let adj = state
                    .adjustment
                    .as_ref()
                    .ok_or_else(|| refuse("no scope adjustment in progress".into()))?;
                if !adj.corrected {
                    return Err(refuse("correction not yet recorded".into()));
                }
                if *from != state.stage || Some(*to) != state.stage.next() || *to > adj.origin {
                    return Err(refuse(format!("cannot replay {} -> {}", from, to)));
                }
            }
            Payload::RunClosed {
                outcome: RunOutcome::Completed,
            } => match &state.approved_gate {
                Some(gate) if gate.stage_to == Stage::Closure => {}
                _ => return Err(refuse("closure gate not approved".into())),
            },
            Payload::HaltResolved { .. } if state.halt.is_none() => {
                return Err(refuse("run is not halted".into()));
            }
            Payload::DriftResolved { .. } if state.pause.is_none() => {
                return Err(refuse("run is not paused".into()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-verify the in-memory chain.
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        verify_entries(&self.entries, Some(self.run_id))
    }

    /// Verify a ledger file on disk, returning the number of entries.
    pub fn verify_file(path: impl AsRef<Path>) -> Result<usize, LedgerError> {
        let entries = Self::read_all(path)?;
        verify_entries(&entries, None)?;
        Ok(entries.len())
    }

    /// Read every complete entry of a ledger file, oldest first.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LedgerError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let (entries, _) = parse_lines(&text)?;
        Ok(entries)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn engine(&self) -> &PermissionEngine {
        &self.engine
    }

    pub fn state(&self) -> &GovernanceState {
        &self.state
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// The last `n` entries.
    pub fn tail(&self, n: usize) -> &[LedgerEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.entries.last().map(|e| e.hash.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Most recent metric snapshot, if any.
    pub fn latest_metric_report(&self) -> Option<&MetricReport> {
        self.entries.iter().rev().find_map(|e| match &e.payload {
            Payload::MetricSnapshot { report } => Some(report),
            _ => None,
        })
    }

    /// Most recent gate decision, if any.
    pub fn latest_gate_decision(&self) -> Option<(Uuid, GateDecision)> {
        self.entries.iter().rev().find_map(|e| match &e.payload {
            Payload::GateResolved {
                signal_id,
                decision,
                ..
            } => Some((*signal_id, *decision)),
            _ => None,
        })
    }
}

/// Write one line durably, cutting the file back on failure.
fn write_line(file: &mut File, path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    let write_failed = |source| LedgerError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let before = file.metadata().map_err(write_failed)?.len();
    let result = file
        .write_all(bytes)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data());
    if let Err(source) = result {
        if let Err(e) = file.set_len(before) {
            tracing::error!(path = %path.display(), error = %e, "could not roll back failed append");
        }
        return Err(write_failed(source));
    }
    Ok(())
}

/// Parse complete lines. Returns the entries and the byte length to keep:
/// a final line without a newline that does not parse is a torn write and
/// falls outside the kept length.
fn parse_lines(text: &str) -> Result<(Vec<LedgerEntry>, usize), LedgerError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    for (index, segment) in text.split_inclusive('\n').enumerate() {
        let complete = segment.ends_with('\n');
        let line = segment.trim();
        if line.is_empty() {
            offset += segment.len();
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                entries.push(entry);
                offset += segment.len();
            }
            Err(_) if !complete => break,
            Err(source) => {
                return Err(LedgerError::Malformed {
                    line: index + 1,
                    source,
                })
            }
        }
    }
    Ok((entries, offset))
}

/// Check sequence numbers, run ids, entry types, prior links and hashes.
fn verify_entries(entries: &[LedgerEntry], run_id: Option<Uuid>) -> Result<(), LedgerError> {
    let expected_run = run_id.or_else(|| entries.first().map(|e| e.run_id));
    let mut prior: Option<&str> = None;
    for (index, entry) in entries.iter().enumerate() {
        let corrupted = |detail: String| LedgerError::Corrupted {
            seq: index as u64,
            detail,
        };
        if let Some(expected) = expected_run {
            if entry.run_id != expected {
                return Err(LedgerError::WrongRun {
                    expected,
                    actual: entry.run_id,
                });
            }
        }
        if entry.seq != index as u64 {
            return Err(corrupted(format!("sequence number {} out of place", entry.seq)));
        }
        if entry.entry_type != entry.payload.entry_type() {
            return Err(corrupted(format!(
                "entry type {} does not match {} payload",
                entry.entry_type,
                entry.payload.kind()
            )));
        }
        if entry.prior_hash.as_deref() != prior {
            return Err(corrupted(format!(
                "prior hash {} does not match {}",
                entry.prior_hash.as_deref().unwrap_or("none"),
                prior.unwrap_or("none")
            )));
        }
        let actual = entry.compute_hash()?;
        if actual != entry.hash {
            return Err(corrupted(format!(
                "stored hash {} does not match content hash {}",
                ks_graph::hasher::short(&entry.hash),
                ks_graph::hasher::short(&actual)
            )));
        }
        prior = Some(entry.hash.as_str());
    }
    Ok(())
}
