// audit.rs — Audit subcommands: verify, tail, check.

use clap::Subcommand;
use ks_audit::Ledger;
use ks_run::{KeystoneConfig, RunLocation, RunStore};

use super::{open_session, resolve_run, with_session};

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the hash chain of the run's ledger file without opening the run.
    Verify,
    /// Show the most recent ledger entries.
    Tail {
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
        /// Print entries as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Check graph hashes and lineage against the ledger. Problems halt the run.
    Check,
}

pub fn execute(
    cmd: &AuditCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify => verify(config, selector),
        AuditCommands::Tail { count, json } => tail(config, selector, *count, *json),
        AuditCommands::Check => check(config, selector),
    }
}

fn verify(config: &KeystoneConfig, selector: Option<&str>) -> anyhow::Result<()> {
    let run_id = resolve_run(config, selector)?;
    let (dir, location) = RunStore::for_config(config).locate(run_id)?;
    let count = Ledger::verify_file(RunStore::ledger_path(&dir))?;
    let place = match location {
        RunLocation::Live => "live",
        RunLocation::Archived => "archived",
    };
    println!("Ledger OK: {} entries verified ({} run {})", count, place, run_id);
    Ok(())
}

fn tail(config: &KeystoneConfig, selector: Option<&str>, count: usize, json: bool) -> anyhow::Result<()> {
    let session = open_session(config, selector)?;
    let entries = session.ledger().tail(count);
    if json {
        for entry in entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    println!(
        "{:<5} {:<22} {:<20} {:<13} {:<4} HASH",
        "SEQ", "TIME", "TYPE", "STAGE", "ROLE"
    );
    println!("{}", "-".repeat(80));
    for entry in entries {
        println!(
            "{:<5} {:<22} {:<20} {:<13} {:<4} {}",
            entry.seq,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.entry_type.to_string(),
            entry.stage.to_string(),
            entry.role.abbreviation(),
            &entry.hash[..12.min(entry.hash.len())],
        );
    }
    Ok(())
}

fn check(config: &KeystoneConfig, selector: Option<&str>) -> anyhow::Result<()> {
    let check = with_session(config, selector, |s| Ok(s.check_integrity()?))?;
    println!(
        "Checked {} artifacts, {} edges, {} ledger entries.",
        check.graph.artifacts_checked, check.graph.edges_checked, check.ledger_entries
    );
    if check.is_clean() {
        println!("Integrity OK.");
        return Ok(());
    }
    let problems = check.problems();
    for problem in &problems {
        println!("  ✗ {}", problem);
    }
    anyhow::bail!("{} integrity problem(s); run halted", problems.len())
}
