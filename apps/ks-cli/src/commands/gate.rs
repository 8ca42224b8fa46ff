// gate.rs — Gate subcommands: propose, approve, reject, status.

use clap::Subcommand;
use ks_policy::GateDecision;
use ks_run::{KeystoneConfig, Signal};

use super::{open_session, with_session};

#[derive(Subcommand)]
pub enum GateCommands {
    /// Ask to leave the current stage; opens a gate for a human decision.
    Propose,
    /// Approve the pending gate. Artifacts of the stage being left are frozen.
    Approve {
        #[arg(long)]
        by: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject the pending gate. The run stays at its stage.
    Reject {
        #[arg(long)]
        by: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Show the pending gate, if any.
    Status,
}

pub fn execute(
    cmd: &GateCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        GateCommands::Propose => with_session(config, selector, |s| {
            let signal = s.propose_advance()?;
            print_signal(&signal);
            println!();
            println!("Awaiting approval: `ks gate approve --by <name>` or `ks gate reject --by <name>`.");
            Ok(())
        }),
        GateCommands::Approve { by, note } => resolve(config, selector, GateDecision::Approve, by, note),
        GateCommands::Reject { by, note } => resolve(config, selector, GateDecision::Reject, by, note),
        GateCommands::Status => {
            let session = open_session(config, selector)?;
            match session.signals().pending() {
                Some(signal) => print_signal(signal),
                None => println!("No gate pending."),
            }
            Ok(())
        }
    }
}

fn resolve(
    config: &KeystoneConfig,
    selector: Option<&str>,
    decision: GateDecision,
    by: &str,
    note: &Option<String>,
) -> anyhow::Result<()> {
    with_session(config, selector, |s| {
        let before = s.graph().artifacts().filter(|a| a.is_immutable).count();
        let signal = s.resolve_gate(decision, by, note.clone())?;
        let frozen = s.graph().artifacts().filter(|a| a.is_immutable).count() - before;
        println!("Gate {} ({}) by {}", signal.signal_type, decision, by);
        if frozen > 0 {
            println!("  {} artifact(s) frozen", frozen);
        }
        if decision == GateDecision::Approve {
            println!("Next: `ks stage advance`.");
        }
        Ok(())
    })
}

fn print_signal(signal: &Signal) {
    println!("Signal:    {}", signal.signal_id);
    println!("Type:      {}", signal.signal_type);
    match signal.stage_to {
        Some(to) => println!("Stages:    {} -> {}", signal.stage_from, to),
        None => println!("Stage:     {}", signal.stage_from),
    }
    println!("Status:    {}", signal.status);
    println!("Artifacts: {}", signal.artifacts_produced.len());
    if let Some(report) = &signal.metric_snapshot {
        println!("Metrics:   overall {}", report.overall);
    }
}
