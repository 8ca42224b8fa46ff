// error.rs — Error types for the run orchestration layer.
//
// Every lower-layer error converts into `RunError` via `#[from]`, so the
// session can use `?` throughout. `kind()` maps each error onto the small
// taxonomy callers (and the CLI's exit codes) care about.

use std::fmt;

use ks_audit::LedgerError;
use ks_graph::GraphError;
use ks_metrics::ThresholdError;
use ks_policy::{DenialReason, PolicyError};
use thiserror::Error;
use uuid::Uuid;

use crate::collaborator::CollaboratorError;

/// Errors that can occur while driving a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The permission machine refused the request. Nothing was written.
    #[error("denied: {0}")]
    Denied(DenialReason),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Threshold(#[from] ThresholdError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The signal chain does not verify.
    #[error("signal chain broken at signal #{index}: {detail}")]
    SignalChainBroken { index: usize, detail: String },

    #[error("unknown signal: {0}")]
    UnknownSignal(Uuid),

    #[error("unknown signal type '{0}'")]
    UnknownSignalType(String),

    /// A signal was emitted for a transition it does not describe.
    #[error("signal {signal_type} cannot be emitted at stage {stage}")]
    SignalStageMismatch { signal_type: String, stage: String },

    /// The snapshot, envelopes and ledger of a run disagree.
    #[error("run cannot be recovered: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Every retry attempt failed.
    #[error("collaborator failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// A collaborator result arrived after the run was halted and was dropped.
    #[error("result discarded: {0}")]
    Discarded(String),

    #[error("run not found: {0}")]
    NotFound(Uuid),

    /// The run has been archived and can no longer be changed.
    #[error("run {0} is archived")]
    Archived(Uuid),

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },

    /// The session lock was poisoned by a panicking holder.
    #[error("session lock poisoned")]
    LockPoisoned,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// Coarse classification of a `RunError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stored data does not match what was recorded. Never auto-repaired.
    Integrity,
    /// A metric fell into its halt band.
    ThresholdBreach,
    /// The run is paused on a scope-drift decision.
    ScopeDrift,
    /// An external generation or metric call failed.
    Collaborator,
    /// The request is not allowed in the current state.
    IllegalAction,
    /// Filesystem, serialization or configuration failure.
    Storage,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Integrity => "integrity",
            ErrorKind::ThresholdBreach => "threshold_breach",
            ErrorKind::ScopeDrift => "scope_drift",
            ErrorKind::Collaborator => "collaborator",
            ErrorKind::IllegalAction => "illegal_action",
            ErrorKind::Storage => "storage",
            ErrorKind::NotFound => "not_found",
        };
        f.write_str(name)
    }
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Denied(reason) => match reason {
                DenialReason::Halted {
                    cause: ks_policy::HaltSource::Metric,
                    ..
                } => ErrorKind::ThresholdBreach,
                DenialReason::Halted {
                    cause: ks_policy::HaltSource::Integrity,
                    ..
                } => ErrorKind::Integrity,
                DenialReason::Paused { .. } => ErrorKind::ScopeDrift,
                DenialReason::ArtifactFrozen => ErrorKind::Integrity,
                _ => ErrorKind::IllegalAction,
            },
            RunError::Graph(e) if e.is_integrity() => ErrorKind::Integrity,
            RunError::Graph(GraphError::NotFound(_)) => ErrorKind::NotFound,
            RunError::Graph(GraphError::IoError { .. })
            | RunError::Graph(GraphError::SerializationError(_))
            | RunError::Graph(GraphError::HeaderError(_))
            | RunError::Graph(GraphError::MalformedEnvelope(_)) => ErrorKind::Storage,
            RunError::Graph(_) => ErrorKind::IllegalAction,
            RunError::Ledger(e) if e.is_integrity() => ErrorKind::Integrity,
            RunError::Ledger(LedgerError::WrongRun { .. }) => ErrorKind::Integrity,
            RunError::Ledger(LedgerError::Closed)
            | RunError::Ledger(LedgerError::InvalidEntry { .. }) => ErrorKind::IllegalAction,
            RunError::Ledger(_) => ErrorKind::Storage,
            RunError::Threshold(_) => ErrorKind::IllegalAction,
            RunError::Policy(_) => ErrorKind::Storage,
            RunError::SignalChainBroken { .. } | RunError::Unrecoverable(_) => {
                ErrorKind::Integrity
            }
            RunError::UnknownSignal(_) | RunError::NotFound(_) => ErrorKind::NotFound,
            RunError::UnknownSignalType(_)
            | RunError::SignalStageMismatch { .. }
            | RunError::Archived(_) => ErrorKind::IllegalAction,
            RunError::Collaborator(_)
            | RunError::RetriesExhausted { .. }
            | RunError::Discarded(_) => ErrorKind::Collaborator,
            RunError::IoError { .. }
            | RunError::SerializationError(_)
            | RunError::ConfigParse { .. }
            | RunError::LockPoisoned
            | RunError::TaskFailed(_) => ErrorKind::Storage,
        }
    }

    /// True when the run itself can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        // A refused write to a frozen artifact changes nothing.
        matches!(self, RunError::Denied(DenialReason::ArtifactFrozen))
            || !matches!(self.kind(), ErrorKind::Integrity | ErrorKind::Storage)
    }
}

impl From<DenialReason> for RunError {
    fn from(reason: DenialReason) -> Self {
        RunError::Denied(reason)
    }
}
