// envelope.rs — Artifact envelope: YAML header + free-form body.
//
// On disk every artifact is a single text file:
//
//   ---
//   artifact_id: 6f1c...
//   artifact_type: hypothesis
//   ...
//   ---
//   <body>
//
// The header carries the artifact's metadata and its outgoing dependencies.
// Decoding re-hashes the body and refuses envelopes whose recorded hash does
// not match, so a hand-edited file is caught at load time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactId, ArtifactType, Relation};
use crate::error::{GraphError, IntegrityViolation};
use crate::hasher;

const FENCE: &str = "---\n";

/// One outgoing dependency recorded in an envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub target: ArtifactId,
    pub relation: Relation,
}

/// Envelope header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub artifact_id: ArtifactId,
    pub artifact_type: ArtifactType,
    pub run_id: Uuid,
    pub stage_origin: u8,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    #[serde(default)]
    pub parent_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub is_immutable: bool,
    pub author: String,
    pub active_role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEnvelope {
    pub header: EnvelopeHeader,
    pub body: String,
}

impl ArtifactEnvelope {
    /// Build an envelope for an artifact and its outgoing dependencies.
    pub fn from_artifact(artifact: &Artifact, dependencies: Vec<DependencyRef>) -> Self {
        Self {
            header: EnvelopeHeader {
                artifact_id: artifact.artifact_id,
                artifact_type: artifact.artifact_type,
                run_id: artifact.run_id,
                stage_origin: artifact.stage_origin,
                created_at: artifact.created_at,
                hash: artifact.hash.clone(),
                parent_hash: artifact.parent_hash.clone(),
                dependencies,
                is_immutable: artifact.is_immutable,
                author: artifact.author.clone(),
                active_role: artifact.active_role.clone(),
            },
            body: artifact.content.clone(),
        }
    }

    /// Render as `---\n<yaml>---\n<body>`.
    pub fn encode(&self) -> Result<String, GraphError> {
        let yaml = serde_yaml::to_string(&self.header)?;
        let mut out = String::with_capacity(yaml.len() + self.body.len() + 8);
        out.push_str(FENCE);
        out.push_str(&yaml);
        if !yaml.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(FENCE);
        out.push_str(&self.body);
        Ok(out)
    }

    /// Parse an envelope and check the body against the recorded hash.
    pub fn decode(text: &str) -> Result<Self, GraphError> {
        let rest = text
            .strip_prefix(FENCE)
            .ok_or_else(|| GraphError::MalformedEnvelope("missing opening fence".into()))?;
        // The header is YAML, so the first line consisting of `---` closes it.
        let (yaml, body) = match rest.find("\n---\n") {
            Some(pos) => (&rest[..pos + 1], &rest[pos + 5..]),
            None => {
                return Err(GraphError::MalformedEnvelope(
                    "missing closing fence".into(),
                ))
            }
        };

        let header: EnvelopeHeader = serde_yaml::from_str(yaml)?;
        let actual = hasher::hash_str(body);
        if actual != header.hash {
            return Err(IntegrityViolation::HashMismatch {
                artifact_id: header.artifact_id,
                expected: header.hash,
                actual,
            }
            .into());
        }

        Ok(Self {
            header,
            body: body.to_string(),
        })
    }

    /// Convert back into an artifact plus its recorded dependencies.
    pub fn into_artifact(self) -> (Artifact, Vec<DependencyRef>) {
        let h = self.header;
        let frozen_hash = h.is_immutable.then(|| h.hash.clone());
        let artifact = Artifact {
            artifact_id: h.artifact_id,
            artifact_type: h.artifact_type,
            run_id: h.run_id,
            stage_origin: h.stage_origin,
            hash: h.hash,
            parent_hash: h.parent_hash,
            is_immutable: h.is_immutable,
            frozen_hash,
            created_at: h.created_at,
            author: h.author,
            active_role: h.active_role,
            annotations: Default::default(),
            content: self.body,
        };
        (artifact, h.dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(body: &str) -> Artifact {
        Artifact::new(
            Uuid::new_v4(),
            ArtifactType::AnalysisNote,
            3,
            body,
            Some(hasher::hash_str("parent")),
            "tester",
            "analyst",
        )
    }

    #[test]
    fn encode_then_decode_keeps_header_and_body() {
        let artifact = sample("line one\n---\nline three after a fence\n");
        let deps = vec![DependencyRef {
            target: ArtifactId::new(),
            relation: Relation::DerivedFrom,
        }];
        let text = ArtifactEnvelope::from_artifact(&artifact, deps.clone())
            .encode()
            .unwrap();
        assert!(text.starts_with("---\nartifact_id:"));

        let decoded = ArtifactEnvelope::decode(&text).unwrap();
        assert_eq!(decoded.body, artifact.content);
        assert_eq!(decoded.header.dependencies, deps);

        let (restored, restored_deps) = decoded.into_artifact();
        assert_eq!(restored.artifact_id, artifact.artifact_id);
        assert_eq!(restored.parent_hash, artifact.parent_hash);
        assert!(restored.hash_matches());
        assert_eq!(restored_deps, deps);
    }

    #[test]
    fn edited_body_fails_hash_check() {
        let artifact = sample("original findings");
        let text = ArtifactEnvelope::from_artifact(&artifact, vec![])
            .encode()
            .unwrap();
        let edited = text.replace("original findings", "edited findings");
        let err = ArtifactEnvelope::decode(&edited).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn missing_fences_are_malformed() {
        assert!(matches!(
            ArtifactEnvelope::decode("no header here"),
            Err(GraphError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            ArtifactEnvelope::decode("---\nartifact_id: x\n"),
            Err(GraphError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn immutable_flag_restores_frozen_hash() {
        let mut artifact = sample("frozen body");
        artifact.is_immutable = true;
        let text = ArtifactEnvelope::from_artifact(&artifact, vec![])
            .encode()
            .unwrap();
        let (restored, _) = ArtifactEnvelope::decode(&text).unwrap().into_artifact();
        assert!(restored.is_immutable);
        assert_eq!(restored.frozen_hash.as_deref(), Some(artifact.hash.as_str()));
    }

    #[test]
    fn empty_body_round_trips() {
        let artifact = sample("");
        let text = ArtifactEnvelope::from_artifact(&artifact, vec![])
            .encode()
            .unwrap();
        assert!(text.ends_with("---\n"));
        let decoded = ArtifactEnvelope::decode(&text).unwrap();
        assert_eq!(decoded.body, "");
    }
}
