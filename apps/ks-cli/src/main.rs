//! # ks-cli
//!
//! Command-line driver for Keystone.
//!
//! Every command opens the selected run from `.keystone/`, performs one
//! operation through a `Session`, and saves the snapshot:
//! - `ks run start/list/status/watch/role/mode` — run lifecycle
//! - `ks artifact produce/supersede/edit/annotate/link/show` — artifacts
//! - `ks metrics evaluate/show` — threshold evaluation
//! - `ks gate propose/approve/reject/status` — human gates
//! - `ks stage advance/freeze-baseline/adjust/replay` — stage movement
//! - `ks drift`, `ks halt` — pauses and halts
//! - `ks audit verify/tail/check`, `ks graph show/lineage/context` — inspection

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ks_run::KeystoneConfig;
use tracing_subscriber::EnvFilter;

/// Keystone — governed, auditable analysis runs.
#[derive(Parser)]
#[command(name = "ks", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".", global = true)]
    project_root: PathBuf,

    /// Run to operate on: a full id or an unambiguous prefix. Defaults to
    /// the most recently created live run.
    #[arg(long, global = true)]
    run: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start, list and inspect runs.
    Run {
        #[command(subcommand)]
        command: commands::run::RunCommands,
    },
    /// Produce and change artifacts.
    Artifact {
        #[command(subcommand)]
        command: commands::artifact::ArtifactCommands,
    },
    /// Evaluate metrics against the threshold canon.
    Metrics {
        #[command(subcommand)]
        command: commands::metrics::MetricsCommands,
    },
    /// Propose and resolve stage gates.
    Gate {
        #[command(subcommand)]
        command: commands::gate::GateCommands,
    },
    /// Advance, freeze and replay stages.
    Stage {
        #[command(subcommand)]
        command: commands::stage::StageCommands,
    },
    /// Report and resolve scope drift.
    Drift {
        #[command(subcommand)]
        command: commands::drift::DriftCommands,
    },
    /// Raise and resolve halts.
    Halt {
        #[command(subcommand)]
        command: commands::halt::HaltCommands,
    },
    /// Inspect and verify the ledger.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
    /// Inspect the artifact graph.
    Graph {
        #[command(subcommand)]
        command: commands::graph::GraphCommands,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env("KS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let config = KeystoneConfig::for_project(&project_root);
    let run = cli.run.as_deref();

    match &cli.command {
        Commands::Run { command } => commands::run::execute(command, &config, run),
        Commands::Artifact { command } => commands::artifact::execute(command, &config, run),
        Commands::Metrics { command } => commands::metrics::execute(command, &config, run),
        Commands::Gate { command } => commands::gate::execute(command, &config, run),
        Commands::Stage { command } => commands::stage::execute(command, &config, run),
        Commands::Drift { command } => commands::drift::execute(command, &config, run),
        Commands::Halt { command } => commands::halt::execute(command, &config, run),
        Commands::Audit { command } => commands::audit::execute(command, &config, run),
        Commands::Graph { command } => commands::graph::execute(command, &config, run),
    }
}
