// projection.rs — One-line context projection of a run.
//
//   run=1f0c2a9b stage=3:analysis role=AN mode=standard
//     metrics=coherence:0.82W,redundancy:0.10P signal=ready_for_synthesis[pending]
//     status=gate_pending
//
// (printed as a single line). Built only from committed state: the folded
// governance state and the latest metric snapshot in the ledger.

use ks_metrics::MetricReport;
use ks_policy::GovernanceState;

/// Render the context line.
pub fn context_line(state: &GovernanceState, report: Option<&MetricReport>) -> String {
    let run = state.run_id.simple().to_string();
    let metrics = match report {
        Some(report) if !report.classified.is_empty() => report
            .classified
            .iter()
            .map(|m| format!("{}:{:.2}{}", m.name, m.value, m.band.marker()))
            .collect::<Vec<_>>()
            .join(","),
        _ => "-".to_string(),
    };
    let signal = match &state.last_signal {
        Some(mark) => format!("{}[{}]", mark.signal_type, mark.status),
        None => "-".to_string(),
    };
    format!(
        "run={} stage={}:{} role={} mode={} metrics={} signal={} status={}",
        &run[..8],
        state.stage.index(),
        state.stage,
        state.role.abbreviation(),
        state.mode,
        metrics,
        signal,
        state.status()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_metrics::{MetricResult, ThresholdEvaluator};
    use ks_policy::{SignalMark, Stage};
    use uuid::Uuid;

    #[test]
    fn fresh_run_has_placeholders() {
        let run_id = Uuid::parse_str("1f0c2a9b-0000-4000-8000-000000000000").unwrap();
        let state = GovernanceState::new(run_id);
        assert_eq!(
            context_line(&state, None),
            "run=1f0c2a9b stage=0:intake role=AN mode=standard metrics=- signal=- status=active"
        );
    }

    #[test]
    fn metrics_carry_band_markers() {
        let mut state = GovernanceState::new(Uuid::new_v4());
        state.stage = Stage::Analysis;
        state.last_signal = Some(SignalMark {
            signal_id: Uuid::new_v4(),
            signal_type: "ready_for_synthesis".into(),
            status: "pending".into(),
        });
        let report = ThresholdEvaluator::default()
            .evaluate(&[
                MetricResult::new("coherence", 0.7),
                MetricResult::new("redundancy", 0.1),
            ])
            .unwrap();
        let line = context_line(&state, Some(&report));
        assert!(line.contains("stage=3:analysis"));
        assert!(line.contains("metrics=coherence:0.70W,redundancy:0.10P"));
        assert!(line.contains("signal=ready_for_synthesis[pending]"));
        assert!(!line.contains('\n'));
    }
}
