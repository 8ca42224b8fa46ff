// mod.rs — Shared helpers for subcommands: run selection, session
// open/save, content input.

pub mod artifact;
pub mod audit;
pub mod drift;
pub mod gate;
pub mod graph;
pub mod halt;
pub mod metrics;
pub mod run;
pub mod stage;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ks_run::{KeystoneConfig, RunStore, Session, SessionOptions};
use uuid::Uuid;

/// Resolve `--run` to a run id. Without a selector the newest live run is
/// used.
pub fn resolve_run(config: &KeystoneConfig, selector: Option<&str>) -> anyhow::Result<Uuid> {
    let store = RunStore::for_config(config);
    let Some(selector) = selector else {
        let runs = store.list(false)?;
        return runs
            .first()
            .map(|r| r.run_id)
            .ok_or_else(|| anyhow::anyhow!("no live runs; start one with `ks run start <title>`"));
    };
    if let Ok(id) = Uuid::parse_str(selector) {
        return Ok(id);
    }

    let needle = selector.to_lowercase();
    let matches: Vec<Uuid> = store
        .list(true)?
        .into_iter()
        .map(|r| r.run_id)
        .filter(|id| id.simple().to_string().starts_with(&needle))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("no run matches '{}'", selector),
        _ => anyhow::bail!(
            "'{}' matches {} runs; use a longer prefix",
            selector,
            matches.len()
        ),
    }
}

/// Resume the selected run with the project's settings.
pub fn open_session(config: &KeystoneConfig, selector: Option<&str>) -> anyhow::Result<Session> {
    let run_id = resolve_run(config, selector)?;
    let store = RunStore::for_config(config);
    let session = Session::resume(&store, run_id, SessionOptions::from_config(config)?)
        .with_context(|| format!("failed to open run {}", run_id))?;
    tracing::debug!(%run_id, entries = session.ledger().len(), "opened run");
    Ok(session)
}

/// Open the run, apply `f`, and save the snapshot even if `f` failed
/// after committing part of its work.
pub fn with_session<T>(
    config: &KeystoneConfig,
    selector: Option<&str>,
    f: impl FnOnce(&mut Session) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut session = open_session(config, selector)?;
    let result = f(&mut session);
    if session.is_dirty() {
        session.save_snapshot()?;
    }
    if let Err(e) = &result {
        tracing::debug!(run_id = %session.run_id(), error = %e, "command failed");
    }
    result
}

/// Body text from `--content` or `--file`.
pub fn read_content(content: Option<&str>, file: Option<&Path>) -> anyhow::Result<String> {
    match (content, file) {
        (Some(text), None) => Ok(text.to_string()),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        (Some(_), Some(_)) => anyhow::bail!("pass either --content or --file, not both"),
        (None, None) => anyhow::bail!("artifact body required: pass --content or --file"),
    }
}

/// Optional content arguments shared by artifact-writing commands.
#[derive(clap::Args)]
pub struct ContentArgs {
    /// Artifact body text.
    #[arg(long)]
    pub content: Option<String>,
    /// Read the artifact body from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl ContentArgs {
    pub fn read(&self) -> anyhow::Result<String> {
        read_content(self.content.as_deref(), self.file.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_comes_from_exactly_one_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("body.md");
        fs::write(&path, "from file").unwrap();

        assert_eq!(read_content(Some("inline"), None).unwrap(), "inline");
        assert_eq!(read_content(None, Some(&path)).unwrap(), "from file");
        assert!(read_content(Some("inline"), Some(&path)).is_err());
        assert!(read_content(None, None).is_err());
    }

    #[test]
    fn run_prefix_resolves() {
        let dir = tempdir().unwrap();
        let config = KeystoneConfig::for_project(dir.path());
        assert!(resolve_run(&config, None).is_err());

        let store = RunStore::for_config(&config);
        let session =
            Session::start(&store, "pricing study", "dana", SessionOptions::default()).unwrap();
        let id = session.run_id();
        let prefix = &id.simple().to_string()[..8];

        assert_eq!(resolve_run(&config, None).unwrap(), id);
        assert_eq!(resolve_run(&config, Some(prefix)).unwrap(), id);
        assert!(resolve_run(&config, Some("zzzz")).is_err());
    }
}
