// error.rs — Error types for the policy subsystem.
//
// Denials are not errors: they are `DenialReason` values inside a
// `Decision`. `PolicyError` covers configuration problems (bad patterns,
// unreadable role books) and unparseable names.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    /// A role pattern is malformed and cannot be parsed as a glob.
    #[error("invalid operation pattern '{pattern}' in role '{role}': {reason}")]
    InvalidPattern {
        role: String,
        pattern: String,
        reason: String,
    },

    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("unknown execution mode '{0}'")]
    UnknownMode(String),

    #[error("unknown choice '{0}'")]
    UnknownChoice(String),

    #[error("failed to read role book {path}: {source}")]
    RoleBookIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse role book: {0}")]
    RoleBookParse(#[from] serde_yaml::Error),
}
