// run.rs — Run subcommands: start, list, status, watch, role, mode, notify.

use std::time::Duration;

use clap::Subcommand;
use ks_audit::{fold, Ledger, Payload};
use ks_policy::{ExecutionMode, RoleTag};
use ks_run::{context_line, KeystoneConfig, RunStore, Session, SessionOptions};

use super::{open_session, resolve_run, with_session};

#[derive(Subcommand)]
pub enum RunCommands {
    /// Start a new run.
    Start {
        /// Run title (e.g., "Q3 pricing study").
        title: String,
        /// Who is starting the run.
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// List runs, newest first.
    List {
        /// Include closed and abandoned runs from the archive.
        #[arg(long)]
        all: bool,
    },
    /// Show a run's state and context line.
    Status {
        /// Print the committed view as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the context line each time the run's ledger grows.
    Watch {
        /// Polling interval in seconds.
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Switch the active role.
    Role {
        /// analyst, observer, coordinator or auditor.
        role: RoleTag,
        #[arg(long)]
        by: String,
    },
    /// Set the execution mode (standard or review).
    Mode {
        mode: ExecutionMode,
        #[arg(long)]
        by: String,
    },
    /// Send a notice to the notification sinks.
    Notify { message: String },
}

pub fn execute(
    cmd: &RunCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        RunCommands::Start { title, by } => start_run(config, title, by),
        RunCommands::List { all } => list_runs(config, *all),
        RunCommands::Status { json } => show_status(config, selector, *json),
        RunCommands::Watch { interval } => watch(config, selector, *interval),
        RunCommands::Role { role, by } => with_session(config, selector, |s| {
            s.switch_role(*role, by)?;
            println!("Role: {}", role);
            Ok(())
        }),
        RunCommands::Mode { mode, by } => with_session(config, selector, |s| {
            s.set_mode(*mode, by)?;
            println!("Mode: {}", mode);
            Ok(())
        }),
        RunCommands::Notify { message } => with_session(config, selector, |s| {
            s.notify(message)?;
            Ok(())
        }),
    }
}

fn start_run(config: &KeystoneConfig, title: &str, by: &str) -> anyhow::Result<()> {
    let store = RunStore::for_config(config);
    let session = Session::start(&store, title, by, SessionOptions::from_config(config)?)?;
    let run = session.run();

    println!("Run started: {}", run.run_id);
    println!("  Title: {}", run.title);
    println!("  Stage: {}", run.stage);
    println!("  Role:  {}", run.role);
    if let Some(dir) = session.dir() {
        println!("  Dir:   {}", dir.display());
    }
    Ok(())
}

fn list_runs(config: &KeystoneConfig, all: bool) -> anyhow::Result<()> {
    let runs = RunStore::for_config(config).list(all)?;
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<10} {:<40} {:<12} {:<14} CREATED",
        "ID", "TITLE", "STAGE", "STATUS"
    );
    println!("{}", "-".repeat(92));
    for run in &runs {
        println!(
            "{:<10} {:<40} {:<12} {:<14} {}",
            run.short_id(),
            truncate(&run.title, 38),
            run.stage.to_string(),
            run.status.to_string(),
            run.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    println!("\n{} run(s)", runs.len());
    Ok(())
}

fn show_status(config: &KeystoneConfig, selector: Option<&str>, json: bool) -> anyhow::Result<()> {
    let session = open_session(config, selector)?;
    let run = session.run();
    let state = session.state();

    if json {
        let view = serde_json::json!({
            "run": run,
            "state": state,
            "context": session.context_projection(),
            "pending_signal": session.signals().pending(),
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Run:       {}", run.run_id);
    println!("Title:     {}", run.title);
    println!("Stage:     {} ({}/7)", state.stage, state.stage.index());
    println!("Role:      {}", state.role);
    println!("Mode:      {}", state.mode);
    println!("Status:    {}", run.status);
    println!("Baseline:  {}", if state.baseline_frozen { "frozen" } else { "open" });
    println!("Artifacts: {}", run.artifact_ids.len());
    println!("Entries:   {}", session.ledger().len());
    if let Some(gate) = &state.pending_gate {
        println!("Gate:      {} awaiting a decision", gate.signal_type);
    }
    if let Some(halt) = &state.halt {
        println!("Halted:    {} ({})", halt.reason, halt.source);
    }
    if let Some(pause) = &state.pause {
        println!("Paused:    {}", pause.reason);
    }
    if let Some(adj) = &state.adjustment {
        println!(
            "Adjusting: {} -> {} (corrected: {})",
            adj.origin, adj.target, adj.corrected
        );
    }
    println!();
    println!("{}", session.context_projection());
    Ok(())
}

/// Poll the ledger file and print the context line whenever it grows.
/// Read-only: the run is never opened for writing.
fn watch(config: &KeystoneConfig, selector: Option<&str>, interval: u64) -> anyhow::Result<()> {
    let run_id = resolve_run(config, selector)?;
    let store = RunStore::for_config(config);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
        let mut seen = 0usize;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => break,
            }
            // The run may move to the archive while we watch.
            let (dir, _) = store.locate(run_id)?;
            let entries = Ledger::read_all(RunStore::ledger_path(&dir))?;
            if entries.len() == seen {
                continue;
            }
            seen = entries.len();

            let state = fold::fold(run_id, &entries);
            let report = entries.iter().rev().find_map(|e| match &e.payload {
                Payload::MetricSnapshot { report } => Some(report),
                _ => None,
            });
            println!("{}", context_line(&state, report));
            if state.closed {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
