// graph.rs — Graph subcommands: show, lineage, context.

use clap::Subcommand;
use ks_graph::ArtifactId;
use ks_run::KeystoneConfig;

use super::open_session;

#[derive(Subcommand)]
pub enum GraphCommands {
    /// List artifacts and dependency edges.
    Show {
        /// Only artifacts on the critical path, in path order.
        #[arg(long)]
        critical: bool,
    },
    /// Walk the parent-hash chain from an artifact back to the root.
    Lineage { id: ArtifactId },
    /// Print the one-line context projection.
    Context,
}

pub fn execute(
    cmd: &GraphCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    let session = open_session(config, selector)?;
    let graph = session.graph();
    match cmd {
        GraphCommands::Show { critical } => {
            let artifacts: Vec<_> = if *critical {
                graph.critical_path()
            } else {
                graph.artifacts().collect()
            };
            if artifacts.is_empty() {
                println!("No artifacts.");
                return Ok(());
            }
            println!(
                "{:<38} {:<18} {:<6} {:<7} HASH",
                "ID", "TYPE", "STAGE", "FROZEN"
            );
            println!("{}", "-".repeat(84));
            for a in &artifacts {
                println!(
                    "{:<38} {:<18} {:<6} {:<7} {}",
                    a.artifact_id.to_string(),
                    a.artifact_type.to_string(),
                    a.stage_origin,
                    if a.is_immutable { "yes" } else { "no" },
                    &a.hash[..12.min(a.hash.len())],
                );
            }
            if !*critical {
                let edges = graph.edges();
                if !edges.is_empty() {
                    println!();
                    for edge in &edges {
                        println!("{} -> {} ({})", edge.from, edge.to, edge.relation);
                    }
                }
            }
            Ok(())
        }
        GraphCommands::Lineage { id } => {
            let lineage = graph.lineage(*id)?;
            for ancestor in lineage {
                match graph.get(ancestor) {
                    Some(a) => println!("{} [{}]", ancestor, a.artifact_type),
                    None => println!("{}", ancestor),
                }
            }
            Ok(())
        }
        GraphCommands::Context => {
            println!("{}", session.context_projection());
            Ok(())
        }
    }
}
