// error.rs — Error types for the ledger.
//
// Uses `thiserror` to derive the standard Rust `Error` trait automatically.
// `Corrupted` and `Malformed` mean the stored chain no longer matches what
// was written: they are integrity violations and are never repaired.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Failed to open, read or create the ledger file.
    #[error("failed to open ledger at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Writing an entry failed; the file was truncated back to its prior length.
    #[error("failed to append ledger entry to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize an entry.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A complete line of the ledger file does not parse as an entry.
    #[error("ledger line {line} is malformed: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    /// The hash chain is broken at `seq`.
    #[error("ledger chain broken at entry #{seq}: {detail}")]
    Corrupted { seq: u64, detail: String },

    /// The file holds entries of a different run.
    #[error("ledger belongs to run {actual}, expected {expected}")]
    WrongRun { expected: Uuid, actual: Uuid },

    /// Nothing may be appended after the run is closed.
    #[error("run is closed; the ledger accepts no further entries")]
    Closed,

    /// The entry would break a structural rule of the ledger.
    #[error("refused {kind} entry: {reason}")]
    InvalidEntry { kind: String, reason: String },
}

impl LedgerError {
    /// True for errors that mean stored data was tampered with or corrupted.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            LedgerError::Corrupted { .. } | LedgerError::Malformed { .. }
        )
    }
}
