// artifact.rs — Artifact data model.
//
// An Artifact is one produced work-product of a run: a scope statement, a
// hypothesis, an analysis note, the final report. Its body is hashed on
// creation and the hash is what every other record (parent links, ledger
// entries, envelopes) refers to.
//
// Artifacts are never deleted. "Changing" one means registering a new
// artifact whose `parent_hash` is the old artifact's hash.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hasher;

/// Unique identifier of an artifact.
///
/// `#[serde(transparent)]` makes this serialize as the bare UUID string,
/// so envelopes and ledger payloads stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The closed set of artifact kinds a run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    ScopeStatement,
    ProblemFrame,
    Baseline,
    Evidence,
    Hypothesis,
    AnalysisNote,
    Synthesis,
    ValidationReport,
    FinalReport,
}

impl ArtifactType {
    /// Every artifact type, in pipeline order.
    pub const ALL: [ArtifactType; 9] = [
        ArtifactType::ScopeStatement,
        ArtifactType::ProblemFrame,
        ArtifactType::Baseline,
        ArtifactType::Evidence,
        ArtifactType::Hypothesis,
        ArtifactType::AnalysisNote,
        ArtifactType::Synthesis,
        ArtifactType::ValidationReport,
        ArtifactType::FinalReport,
    ];

    /// The foundational chain all later work depends on, in path order.
    pub const CRITICAL_PATH: [ArtifactType; 3] = [
        ArtifactType::ScopeStatement,
        ArtifactType::ProblemFrame,
        ArtifactType::Baseline,
    ];

    /// True for types on the critical path. These are immutable from creation.
    pub fn is_critical_path(&self) -> bool {
        Self::CRITICAL_PATH.contains(self)
    }

    /// Position on the critical path, if any.
    pub fn critical_path_position(&self) -> Option<usize> {
        Self::CRITICAL_PATH.iter().position(|t| t == self)
    }

    /// Index of the first stage at which this type may be produced.
    pub fn earliest_stage(&self) -> u8 {
        match self {
            ArtifactType::ScopeStatement | ArtifactType::Evidence => 0,
            ArtifactType::ProblemFrame | ArtifactType::Hypothesis => 1,
            ArtifactType::Baseline => 2,
            ArtifactType::AnalysisNote => 3,
            ArtifactType::Synthesis => 4,
            ArtifactType::ValidationReport => 5,
            ArtifactType::FinalReport => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::ScopeStatement => "scope_statement",
            ArtifactType::ProblemFrame => "problem_frame",
            ArtifactType::Baseline => "baseline",
            ArtifactType::Evidence => "evidence",
            ArtifactType::Hypothesis => "hypothesis",
            ArtifactType::AnalysisNote => "analysis_note",
            ArtifactType::Synthesis => "synthesis",
            ArtifactType::ValidationReport => "validation_report",
            ArtifactType::FinalReport => "final_report",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown artifact type '{}'", s))
    }
}

/// How a dependent artifact relates to the artifact it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    DerivedFrom,
    ConstrainedBy,
    References,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::DerivedFrom => write!(f, "derived_from"),
            Relation::ConstrainedBy => write!(f, "constrained_by"),
            Relation::References => write!(f, "references"),
        }
    }
}

impl std::str::FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "derived_from" => Ok(Relation::DerivedFrom),
            "constrained_by" => Ok(Relation::ConstrainedBy),
            "references" => Ok(Relation::References),
            other => Err(format!("unknown relation '{}'", other)),
        }
    }
}

/// A single produced work-product.
///
/// The body (`content`) is not part of the serialized index: it travels in
/// the artifact's envelope file and is re-attached on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub artifact_type: ArtifactType,
    pub run_id: Uuid,
    /// Index of the stage that produced this artifact.
    pub stage_origin: u8,
    /// SHA-256 of `content`.
    pub hash: String,
    /// Hash of the immediate predecessor; `None` only for the run's root artifact.
    pub parent_hash: Option<String>,
    pub is_immutable: bool,
    /// Hash captured at the moment the artifact was frozen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub active_role: String,
    /// Metadata-only annotations; the one thing that may change after freeze.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip)]
    pub content: String,
}

impl Artifact {
    /// Create a new, mutable artifact with its content hash computed.
    pub fn new(
        run_id: Uuid,
        artifact_type: ArtifactType,
        stage_origin: u8,
        content: impl Into<String>,
        parent_hash: Option<String>,
        author: impl Into<String>,
        active_role: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            artifact_id: ArtifactId::new(),
            artifact_type,
            run_id,
            stage_origin,
            hash: hasher::hash_str(&content),
            parent_hash,
            is_immutable: false,
            frozen_hash: None,
            created_at: Utc::now(),
            author: author.into(),
            active_role: active_role.into(),
            annotations: BTreeMap::new(),
            content,
        }
    }

    /// Recompute the digest of the current body.
    pub fn compute_hash(&self) -> String {
        hasher::hash_str(&self.content)
    }

    /// True when `hash` matches the body.
    pub fn hash_matches(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn is_on_critical_path(&self) -> bool {
        self.artifact_type.is_critical_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_artifact_hashes_its_content() {
        let a = Artifact::new(
            Uuid::new_v4(),
            ArtifactType::Evidence,
            0,
            "observed",
            None,
            "tester",
            "analyst",
        );
        assert_eq!(a.hash, hasher::hash_str("observed"));
        assert!(a.hash_matches());
        assert!(!a.is_immutable);
    }

    #[test]
    fn critical_path_membership() {
        assert!(ArtifactType::ScopeStatement.is_critical_path());
        assert!(ArtifactType::Baseline.is_critical_path());
        assert!(!ArtifactType::Hypothesis.is_critical_path());
        assert_eq!(ArtifactType::ProblemFrame.critical_path_position(), Some(1));
    }

    #[test]
    fn artifact_type_parses_its_display_form() {
        for t in ArtifactType::ALL {
            assert_eq!(t.to_string().parse::<ArtifactType>().unwrap(), t);
        }
        assert!("memo".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn content_is_not_part_of_serialized_index() {
        let a = Artifact::new(
            Uuid::new_v4(),
            ArtifactType::Evidence,
            0,
            "secret body",
            None,
            "tester",
            "analyst",
        );
        let json = serde_json::to_string(&a).unwrap();
        assert!(!json.contains("secret body"));
        assert!(!json.contains("annotations"));
        let restored: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.hash, a.hash);
        assert!(restored.content.is_empty());
    }
}
