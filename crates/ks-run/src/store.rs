// store.rs — RunStore: on-disk layout of runs.
//
// Each run gets its own directory:
//
//   <runs_dir>/<run_id>/
//     snapshot.json   run record + graph index, rewritten atomically
//     ledger.jsonl    the hash-chained ledger (append-only)
//     artifacts/      one envelope file per artifact
//
// Closing a run moves its directory under the archive. Archived runs are
// read-only.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ks_graph::{write_atomic, GraphIndex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::KeystoneConfig;
use crate::error::RunError;
use crate::run::Run;

const SNAPSHOT_FILE: &str = "snapshot.json";
const LEDGER_FILE: &str = "ledger.jsonl";
const ARTIFACTS_DIR: &str = "artifacts";

/// Everything about a run that is not in the ledger or the envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub graph: GraphIndex,
    /// Number of ledger entries reflected in `graph`.
    pub ledger_entries: u64,
    /// Hash of the last reflected entry.
    pub ledger_head: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// Where a run directory was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLocation {
    Live,
    Archived,
}

/// Persistent store for run directories.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl AsRef<Path>, archive_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: runs_dir.as_ref().to_path_buf(),
            archive_dir: archive_dir.as_ref().to_path_buf(),
        }
    }

    pub fn for_config(config: &KeystoneConfig) -> Self {
        Self::new(&config.runs_dir, &config.archive_dir)
    }

    /// Create the directory of a new run.
    pub fn create(&self, run_id: Uuid) -> Result<PathBuf, RunError> {
        let dir = self.runs_dir.join(run_id.to_string());
        fs::create_dir_all(dir.join(ARTIFACTS_DIR)).map_err(|source| RunError::IoError {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(dir)
    }

    /// Directory of a run, live or archived.
    pub fn locate(&self, run_id: Uuid) -> Result<(PathBuf, RunLocation), RunError> {
        let live = self.runs_dir.join(run_id.to_string());
        if live.is_dir() {
            return Ok((live, RunLocation::Live));
        }
        let archived = self.archive_dir.join(run_id.to_string());
        if archived.is_dir() {
            return Ok((archived, RunLocation::Archived));
        }
        Err(RunError::NotFound(run_id))
    }

    pub fn ledger_path(dir: &Path) -> PathBuf {
        dir.join(LEDGER_FILE)
    }

    pub fn artifacts_dir(dir: &Path) -> PathBuf {
        dir.join(ARTIFACTS_DIR)
    }

    pub fn snapshot_path(dir: &Path) -> PathBuf {
        dir.join(SNAPSHOT_FILE)
    }

    /// Write the snapshot atomically.
    pub fn save_snapshot(dir: &Path, snapshot: &RunSnapshot) -> Result<(), RunError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&Self::snapshot_path(dir), &json)?;
        Ok(())
    }

    /// Read a run's snapshot, if one was ever saved.
    pub fn load_snapshot(dir: &Path) -> Result<Option<RunSnapshot>, RunError> {
        let path = Self::snapshot_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|source| RunError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// All runs with a readable snapshot, newest first. Archived runs are
    /// included when `include_archived` is set.
    pub fn list(&self, include_archived: bool) -> Result<Vec<Run>, RunError> {
        let mut runs = self.list_dir(&self.runs_dir)?;
        if include_archived {
            runs.extend(self.list_dir(&self.archive_dir)?);
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<Run>, RunError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let io_err = |source| RunError::IoError {
            path: dir.display().to_string(),
            source,
        };
        let mut runs = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_dir() {
                continue;
            }
            match Self::load_snapshot(&path) {
                Ok(Some(snapshot)) => runs.push(snapshot.run),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run snapshot")
                }
            }
        }
        Ok(runs)
    }

    /// Move a run's directory into the archive. Returns the new directory.
    pub fn archive(&self, run_id: Uuid) -> Result<PathBuf, RunError> {
        let (dir, location) = self.locate(run_id)?;
        if location == RunLocation::Archived {
            return Err(RunError::Archived(run_id));
        }
        fs::create_dir_all(&self.archive_dir).map_err(|source| RunError::IoError {
            path: self.archive_dir.display().to_string(),
            source,
        })?;
        let target = self.archive_dir.join(run_id.to_string());
        fs::rename(&dir, &target).map_err(|source| RunError::IoError {
            path: target.display().to_string(),
            source,
        })?;
        tracing::info!(run_id = %run_id, path = %target.display(), "run archived");
        Ok(target)
    }
}
