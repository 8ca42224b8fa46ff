// drift.rs — Drift subcommands: report, resolve.

use clap::Subcommand;
use ks_policy::DriftChoice;
use ks_run::KeystoneConfig;

use super::with_session;

#[derive(Subcommand)]
pub enum DriftCommands {
    /// Flag scope drift; the run pauses until resolved.
    Report { reason: String },
    /// Resolve the drift pause.
    Resolve {
        /// exclude, expand_scope or clarify.
        choice: DriftChoice,
        #[arg(long)]
        by: String,
        #[arg(long)]
        note: Option<String>,
    },
}

pub fn execute(
    cmd: &DriftCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        DriftCommands::Report { reason } => with_session(config, selector, |s| {
            s.report_drift(reason)?;
            println!("Run paused: {}", reason);
            Ok(())
        }),
        DriftCommands::Resolve { choice, by, note } => with_session(config, selector, |s| {
            s.resolve_drift(*choice, by, note.clone())?;
            println!("Drift resolved ({:?}) by {}", choice, by);
            Ok(())
        }),
    }
}
