// error.rs — Error types for the artifact graph subsystem.
//
// Ordinary failures (unknown ids, duplicate registrations, rejected edges)
// are plain `GraphError` variants. Anything that means stored data no longer
// matches what was recorded is an `IntegrityViolation`: those are never
// repaired automatically and callers treat them as fatal for the operation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{ArtifactId, Relation};

/// A broken structural or cryptographic guarantee of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum IntegrityViolation {
    /// Something other than an annotation was changed on an immutable artifact.
    #[error("artifact {artifact_id} is immutable; refused change to {field}")]
    ImmutableMutation {
        artifact_id: ArtifactId,
        field: String,
    },

    /// The recorded content hash does not match the body.
    #[error("artifact {artifact_id} body hashes to {actual}, recorded {expected}")]
    HashMismatch {
        artifact_id: ArtifactId,
        expected: String,
        actual: String,
    },

    /// A frozen artifact no longer hashes to the value captured at freeze.
    #[error("artifact {artifact_id} changed since freeze: frozen {frozen}, now {actual}")]
    ChangedSinceFreeze {
        artifact_id: ArtifactId,
        frozen: String,
        actual: String,
    },

    /// Walking `parent_hash` links hit a hash no artifact carries.
    #[error("lineage of {artifact_id} broken: no artifact with hash {missing}")]
    BrokenLineage {
        artifact_id: ArtifactId,
        missing: String,
    },

    /// An edge points at an arena slot that does not exist.
    #[error("edge #{index} references a missing artifact")]
    OrphanEdge { index: usize },

    /// The edge set is not acyclic.
    #[error("dependency graph contains a cycle through {} artifact(s)", .artifacts.len())]
    Cycle { artifacts: Vec<ArtifactId> },
}

/// Errors that can occur during graph and artifact-store operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An artifact with this id is already registered.
    #[error("artifact {0} is already registered")]
    DuplicateArtifact(ArtifactId),

    /// The requested artifact does not exist.
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),

    /// `parent_hash` does not name any registered artifact.
    #[error("parent hash {parent_hash} of artifact {artifact_id} does not reference a known artifact")]
    UnknownParent {
        artifact_id: ArtifactId,
        parent_hash: String,
    },

    /// Only the first artifact of a run may omit its parent.
    #[error("artifact {0} has no parent but the run already has a root artifact")]
    MissingParent(ArtifactId),

    /// The artifact belongs to a different run than the graph.
    #[error("artifact {artifact_id} belongs to run {actual}, graph is for run {expected}")]
    WrongRun {
        artifact_id: ArtifactId,
        expected: uuid::Uuid,
        actual: uuid::Uuid,
    },

    /// Inserting the edge would close a cycle.
    #[error("edge {from} -> {to} would close a cycle")]
    CycleDetected { from: ArtifactId, to: ArtifactId },

    /// An artifact cannot depend on itself.
    #[error("artifact {0} cannot depend on itself")]
    SelfLoop(ArtifactId),

    /// The same edge is already present.
    #[error("edge {from} -> {to} ({relation}) already exists")]
    DuplicateEdge {
        from: ArtifactId,
        to: ArtifactId,
        relation: Relation,
    },

    /// Another artifact names this one as its parent, so its hash is pinned.
    #[error("artifact {0} is the parent of another artifact; supersede it instead of editing")]
    ReferencedByChild(ArtifactId),

    /// A stored or supplied guarantee is broken.
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    /// The envelope text could not be split into header and body.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize graph data.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Failed to parse or emit an envelope header.
    #[error("envelope header error: {0}")]
    HeaderError(#[from] serde_yaml::Error),
}

impl GraphError {
    /// True when the failure is an integrity violation rather than a
    /// rejected request.
    pub fn is_integrity(&self) -> bool {
        matches!(self, GraphError::Integrity(_))
    }
}
