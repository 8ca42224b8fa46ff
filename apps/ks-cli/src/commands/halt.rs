// halt.rs — Halt subcommands: raise, resolve.

use clap::Subcommand;
use ks_policy::HaltChoice;
use ks_run::KeystoneConfig;

use super::with_session;

#[derive(Subcommand)]
pub enum HaltCommands {
    /// Stop all automated work immediately.
    Raise { reason: String },
    /// Resume the halted run, or abandon it.
    Resolve {
        /// resume or abandon.
        choice: HaltChoice,
        #[arg(long)]
        by: String,
        #[arg(long)]
        note: Option<String>,
    },
}

pub fn execute(
    cmd: &HaltCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        HaltCommands::Raise { reason } => with_session(config, selector, |s| {
            s.halt_immediate(reason)?;
            println!("Run halted: {}", reason);
            Ok(())
        }),
        HaltCommands::Resolve { choice, by, note } => with_session(config, selector, |s| {
            s.resolve_halt(*choice, by, note.clone())?;
            match choice {
                HaltChoice::Resume => println!("Halt resolved; run resumed."),
                HaltChoice::Abandon => println!("Run abandoned and archived."),
            }
            Ok(())
        }),
    }
}
