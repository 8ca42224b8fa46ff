// artifact.rs — Artifact subcommands: produce, supersede, edit, annotate,
// link, show, scope.

use clap::Subcommand;
use ks_graph::{ArtifactId, ArtifactType, Relation};
use ks_run::KeystoneConfig;

use super::{open_session, with_session, ContentArgs};

#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// Produce a new artifact at the current stage.
    Produce {
        /// scope_statement, problem_frame, hypothesis, evidence, baseline,
        /// analysis_note, synthesis, validation_report or final_report.
        artifact_type: ArtifactType,
        #[command(flatten)]
        body: ContentArgs,
        /// Dependency as `<id>` or `<id>:<relation>` (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Replace an artifact with a new one derived from it.
    Supersede {
        id: ArtifactId,
        #[command(flatten)]
        body: ContentArgs,
    },
    /// Revise the scope statement (before the baseline is frozen).
    Scope {
        #[command(flatten)]
        body: ContentArgs,
    },
    /// Replace the body of a mutable artifact.
    Edit {
        id: ArtifactId,
        #[command(flatten)]
        body: ContentArgs,
    },
    /// Set a metadata annotation.
    Annotate {
        id: ArtifactId,
        key: String,
        value: String,
    },
    /// Add a dependency edge `from -> to`.
    Link {
        from: ArtifactId,
        to: ArtifactId,
        #[arg(long, default_value = "references")]
        relation: Relation,
    },
    /// Show an artifact's metadata and body.
    Show { id: ArtifactId },
}

pub fn execute(
    cmd: &ArtifactCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        ArtifactCommands::Produce {
            artifact_type,
            body,
            depends_on,
        } => {
            let content = body.read()?;
            let deps = depends_on
                .iter()
                .map(|d| parse_dependency(d))
                .collect::<anyhow::Result<Vec<_>>>()?;
            with_session(config, selector, |s| {
                let id = s.produce_artifact(*artifact_type, content, &deps)?;
                print_artifact_line("Produced", s, id);
                Ok(())
            })
        }
        ArtifactCommands::Supersede { id, body } => {
            let content = body.read()?;
            with_session(config, selector, |s| {
                let new_id = s.supersede_artifact(*id, content)?;
                print_artifact_line("Superseded by", s, new_id);
                Ok(())
            })
        }
        ArtifactCommands::Scope { body } => {
            let content = body.read()?;
            with_session(config, selector, |s| {
                let id = s.change_scope(content)?;
                print_artifact_line("Scope revised", s, id);
                Ok(())
            })
        }
        ArtifactCommands::Edit { id, body } => {
            let content = body.read()?;
            with_session(config, selector, |s| {
                let hash = s.edit_artifact(*id, content)?;
                println!("Edited {} (hash {})", id, &hash[..12.min(hash.len())]);
                Ok(())
            })
        }
        ArtifactCommands::Annotate { id, key, value } => with_session(config, selector, |s| {
            s.annotate_artifact(*id, key, value)?;
            println!("Annotated {}: {} = {}", id, key, value);
            Ok(())
        }),
        ArtifactCommands::Link { from, to, relation } => with_session(config, selector, |s| {
            s.link_artifacts(*from, *to, *relation)?;
            println!("Linked {} -> {} ({})", from, to, relation);
            Ok(())
        }),
        ArtifactCommands::Show { id } => show_artifact(config, selector, *id),
    }
}

/// `<id>` or `<id>:<relation>`; the relation defaults to `references`.
fn parse_dependency(arg: &str) -> anyhow::Result<(ArtifactId, Relation)> {
    let (id, relation) = match arg.split_once(':') {
        Some((id, relation)) => (id, relation.parse().map_err(anyhow::Error::msg)?),
        None => (arg, Relation::References),
    };
    let id = id
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid artifact id '{}': {}", id, e))?;
    Ok((id, relation))
}

fn print_artifact_line(label: &str, session: &ks_run::Session, id: ArtifactId) {
    match session.graph().get(id) {
        Some(a) => println!(
            "{} {} [{}] stage {} {}",
            label,
            id,
            a.artifact_type,
            a.stage_origin,
            if a.is_immutable { "(frozen)" } else { "" }
        ),
        None => println!("{} {}", label, id),
    }
}

fn show_artifact(
    config: &KeystoneConfig,
    selector: Option<&str>,
    id: ArtifactId,
) -> anyhow::Result<()> {
    let session = open_session(config, selector)?;
    let artifact = session
        .graph()
        .get(id)
        .ok_or_else(|| anyhow::anyhow!("artifact not found: {}", id))?;

    println!("Artifact:  {}", artifact.artifact_id);
    println!("Type:      {}", artifact.artifact_type);
    println!("Stage:     {}", artifact.stage_origin);
    println!("Hash:      {}", artifact.hash);
    println!("Parent:    {}", artifact.parent_hash.as_deref().unwrap_or("-"));
    println!("Author:    {} ({})", artifact.author, artifact.active_role);
    println!("Frozen:    {}", artifact.is_immutable);
    for (key, value) in &artifact.annotations {
        println!("  {} = {}", key, value);
    }
    let deps = session.graph().edges_from(id)?;
    for edge in deps {
        println!("  -> {} ({})", edge.to, edge.relation);
    }
    println!();
    println!("{}", artifact.content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_arguments() {
        let id = ArtifactId::new();
        let (parsed, relation) = parse_dependency(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(relation, Relation::References);

        let (_, relation) = parse_dependency(&format!("{}:derived_from", id)).unwrap();
        assert_eq!(relation, Relation::DerivedFrom);

        assert!(parse_dependency("not-an-id").is_err());
        assert!(parse_dependency(&format!("{}:sideways", id)).is_err());
    }
}
