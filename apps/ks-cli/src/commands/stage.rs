// stage.rs — Stage subcommands: advance, freeze-baseline, adjust, replay.

use clap::Subcommand;
use ks_policy::Stage;
use ks_run::KeystoneConfig;

use super::with_session;

#[derive(Subcommand)]
pub enum StageCommands {
    /// Move to the stage the approved gate leads to. Advancing from
    /// reporting closes and archives the run.
    Advance,
    /// Freeze every artifact and mark the baseline frozen.
    FreezeBaseline,
    /// Jump back to an earlier stage (at most baseline) to correct it.
    Adjust {
        /// Stage to return to (intake, framing or baseline).
        target: Stage,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: String,
    },
    /// Replay forward to the stage the adjustment started from.
    Replay,
}

pub fn execute(
    cmd: &StageCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        StageCommands::Advance => with_session(config, selector, |s| {
            let from = s.state().stage;
            let to = s.advance_stage()?;
            println!("Stage: {} -> {}", from, to);
            if s.state().closed {
                println!("Run closed and archived.");
            }
            Ok(())
        }),
        StageCommands::FreezeBaseline => with_session(config, selector, |s| {
            let frozen = s.freeze_baseline()?;
            println!("Baseline frozen ({} artifact(s) newly frozen).", frozen.len());
            Ok(())
        }),
        StageCommands::Adjust { target, by, reason } => with_session(config, selector, |s| {
            let origin = s.state().stage;
            s.micro_adjust(*target, by, reason)?;
            println!("Adjusting: {} -> {} (mode: {})", origin, target, s.state().mode);
            println!("Produce or supersede the correction, then `ks stage replay`.");
            Ok(())
        }),
        StageCommands::Replay => with_session(config, selector, |s| {
            let stage = s.replay_forward()?;
            println!("Replayed forward to {} (mode: {}).", stage, s.state().mode);
            Ok(())
        }),
    }
}
