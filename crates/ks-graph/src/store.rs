// store.rs — ArtifactStore: one envelope file per artifact.
//
// Layout: `<dir>/<artifact_id>.md`. Files are written atomically (temp file
// in the same directory, then rename) so a crash never leaves a half-written
// envelope behind.
//
// The store never overwrites an immutable envelope with different content.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, ArtifactId};
use crate::envelope::{ArtifactEnvelope, DependencyRef};
use crate::error::{GraphError, IntegrityViolation};
use crate::graph::{ArtifactGraph, GraphIndex};

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GraphError> {
    let io_err = |source| GraphError::IoError {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Directory of artifact envelopes for one run.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Create a store backed by `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, GraphError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| GraphError::IoError {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an artifact's envelope.
    ///
    /// Re-saving is allowed (the immutable flag or dependency list may have
    /// changed) unless the file on disk is immutable and carries a different
    /// content hash.
    pub fn save(
        &self,
        artifact: &Artifact,
        dependencies: Vec<DependencyRef>,
    ) -> Result<(), GraphError> {
        let path = self.envelope_path(artifact.artifact_id);
        if path.exists() {
            let existing = self.read_envelope(&path)?;
            if existing.header.is_immutable && existing.header.hash != artifact.hash {
                return Err(IntegrityViolation::ImmutableMutation {
                    artifact_id: artifact.artifact_id,
                    field: "content".to_string(),
                }
                .into());
            }
        }

        let text = ArtifactEnvelope::from_artifact(artifact, dependencies).encode()?;
        write_atomic(&path, text.as_bytes())
    }

    /// Load and verify one envelope.
    pub fn load(&self, id: ArtifactId) -> Result<(Artifact, Vec<DependencyRef>), GraphError> {
        let path = self.envelope_path(id);
        if !path.exists() {
            return Err(GraphError::NotFound(id));
        }
        Ok(self.read_envelope(&path)?.into_artifact())
    }

    /// Load every body in the store, verifying each envelope's hash.
    pub fn load_bodies(&self) -> Result<HashMap<ArtifactId, String>, GraphError> {
        let mut bodies = HashMap::new();
        for id in self.list_ids()? {
            let (artifact, _) = self.load(id)?;
            bodies.insert(id, artifact.content);
        }
        Ok(bodies)
    }

    /// Rebuild a graph from a snapshot index, reading each listed body.
    ///
    /// Envelopes not named by the index (left by an uncommitted write) are
    /// ignored.
    pub fn load_graph(&self, index: GraphIndex) -> Result<ArtifactGraph, GraphError> {
        let mut bodies = HashMap::with_capacity(index.artifacts.len());
        for artifact in &index.artifacts {
            let (loaded, _) = self.load(artifact.artifact_id)?;
            bodies.insert(artifact.artifact_id, loaded.content);
        }
        ArtifactGraph::restore(index, bodies)
    }

    /// Ids of every envelope in the store, sorted.
    pub fn list_ids(&self) -> Result<Vec<ArtifactId>, GraphError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| GraphError::IoError {
            path: self.dir.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| GraphError::IoError {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                // Skip stray files whose stem is not an artifact id.
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ArtifactId>().ok())
                {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read_envelope(&self, path: &Path) -> Result<ArtifactEnvelope, GraphError> {
        let text = fs::read_to_string(path).map_err(|source| GraphError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        ArtifactEnvelope::decode(&text)
    }

    fn envelope_path(&self, id: ArtifactId) -> PathBuf {
        self.dir.join(format!("{}.md", id))
    }
}
