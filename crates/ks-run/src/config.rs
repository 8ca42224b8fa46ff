// config.rs — Project layout and settings.
//
// KeystoneConfig determines where a project keeps its runs, archive and
// event log. The `for_project()` constructor lays everything out under a
// `.keystone/` directory in the project root:
//
//   .keystone/
//     keystone.toml      settings (optional)
//     thresholds.toml    threshold canon (optional)
//     roles.yaml         role book overrides (optional)
//     events.jsonl       notification log
//     runs/<run_id>/     live runs
//     archive/<run_id>/  closed runs

use std::fs;
use std::path::{Path, PathBuf};

use ks_metrics::ThresholdCanon;
use ks_policy::{ExecutionMode, RoleBook, RoleTag};
use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Paths of a Keystone project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoneConfig {
    pub project_root: PathBuf,
    pub keystone_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub events_log: PathBuf,
    pub settings_path: PathBuf,
    pub thresholds_path: PathBuf,
    pub roles_path: PathBuf,
}

impl KeystoneConfig {
    /// Standard `.keystone/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let ks_dir = root.join(".keystone");
        Self {
            project_root: root,
            runs_dir: ks_dir.join("runs"),
            archive_dir: ks_dir.join("archive"),
            events_log: ks_dir.join("events.jsonl"),
            settings_path: ks_dir.join("keystone.toml"),
            thresholds_path: ks_dir.join("thresholds.toml"),
            roles_path: ks_dir.join("roles.yaml"),
            keystone_dir: ks_dir,
        }
    }

    pub fn load_settings(&self) -> Result<Settings, RunError> {
        Settings::load_or_default(&self.settings_path)
    }

    /// The threshold canon; documented defaults when the file is absent.
    pub fn load_canon(&self) -> Result<ThresholdCanon, RunError> {
        Ok(ThresholdCanon::load_or_default(&self.thresholds_path)?)
    }

    /// The role book; built-in roles when the file is absent.
    pub fn load_roles(&self) -> Result<RoleBook, RunError> {
        Ok(RoleBook::load_or_builtin(&self.roles_path)?)
    }
}

/// Settings from `.keystone/keystone.toml`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds between background snapshot saves.
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,

    /// Attempts per collaborator call before giving up.
    #[serde(default = "default_max_attempts")]
    pub collaborator_max_attempts: u32,

    #[serde(default)]
    pub default_role: RoleTag,

    #[serde(default)]
    pub default_mode: ExecutionMode,

    /// Recorded as the author of produced artifacts.
    #[serde(default = "default_author")]
    pub author: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            autosave_secs: default_autosave_secs(),
            collaborator_max_attempts: default_max_attempts(),
            default_role: RoleTag::default(),
            default_mode: ExecutionMode::default(),
            author: default_author(),
        }
    }
}

// Serde default functions
fn default_autosave_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_author() -> String {
    "keystone".to_string()
}

impl Settings {
    /// Load settings. A missing file yields defaults; a present but
    /// malformed one is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, RunError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| RunError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| RunError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_is_under_dot_keystone() {
        let config = KeystoneConfig::for_project("/work/study");
        assert_eq!(config.keystone_dir, PathBuf::from("/work/study/.keystone"));
        assert_eq!(config.runs_dir, PathBuf::from("/work/study/.keystone/runs"));
        assert_eq!(
            config.thresholds_path,
            PathBuf::from("/work/study/.keystone/thresholds.toml")
        );
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = KeystoneConfig::for_project(dir.path());
        assert_eq!(config.load_settings().unwrap(), Settings::default());
        assert_eq!(config.load_canon().unwrap(), ThresholdCanon::default());
        assert_eq!(config.load_roles().unwrap(), RoleBook::builtin());
    }

    #[test]
    fn partial_settings_keep_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystone.toml");
        fs::write(&path, "author = \"dana\"\ndefault_role = \"coordinator\"\n").unwrap();
        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings.author, "dana");
        assert_eq!(settings.default_role, RoleTag::Coordinator);
        assert_eq!(settings.autosave_secs, 30);
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystone.toml");
        fs::write(&path, "autosave_secs = \"soon\"").unwrap();
        assert!(matches!(
            Settings::load_or_default(&path),
            Err(RunError::ConfigParse { .. })
        ));
    }
}
