// metrics.rs — Metrics subcommands: evaluate, show.

use clap::Subcommand;
use ks_metrics::{MetricReport, MetricResult};
use ks_run::KeystoneConfig;

use super::{open_session, with_session};

#[derive(Subcommand)]
pub enum MetricsCommands {
    /// Band metric results against the threshold canon and record them.
    Evaluate {
        /// Results as `name=value` (e.g., coherence=0.82).
        #[arg(required = true)]
        results: Vec<String>,
    },
    /// Show the latest recorded metric snapshot.
    Show,
}

pub fn execute(
    cmd: &MetricsCommands,
    config: &KeystoneConfig,
    selector: Option<&str>,
) -> anyhow::Result<()> {
    match cmd {
        MetricsCommands::Evaluate { results } => {
            let results = results
                .iter()
                .map(|r| parse_result(r))
                .collect::<anyhow::Result<Vec<_>>>()?;
            with_session(config, selector, |s| {
                let report = s.evaluate_metrics(&results)?;
                print_report(&report);
                if report.halted {
                    println!();
                    println!("Run HALTED: resolve with `ks halt resolve <resume|abandon> --by <name>`.");
                }
                Ok(())
            })
        }
        MetricsCommands::Show => {
            let session = open_session(config, selector)?;
            match session.ledger().latest_metric_report() {
                Some(report) => print_report(report),
                None => println!("No metric snapshots recorded."),
            }
            Ok(())
        }
    }
}

fn parse_result(arg: &str) -> anyhow::Result<MetricResult> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected name=value, got '{}'", arg))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e))?;
    Ok(MetricResult::new(name.trim(), value))
}

fn print_report(report: &MetricReport) {
    println!("{:<20} {:>8} {:<8} NOTE", "METRIC", "VALUE", "BAND");
    println!("{}", "-".repeat(50));
    for m in &report.classified {
        println!(
            "{:<20} {:>8.4} {:<8} {}",
            m.name,
            m.value,
            m.band.to_string(),
            if m.near_floor { "near floor" } else { "" }
        );
    }
    println!();
    println!(
        "Overall: {}  warning streak: {}",
        report.overall, report.warning_streak
    );
}
