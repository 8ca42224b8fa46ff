// evaluator.rs — Classify metric results into pass / warning / halt bands.
//
// Banding for a higher-is-better metric with bounds (pass, warning, halt):
//
//   value >= pass            → pass
//   value <  halt            → halt   (the floor itself does not halt)
//   otherwise                → warning, flagged `near_floor` below `warning`
//
// Lower-is-better metrics mirror this. A single halt band halts the whole
// snapshot; warnings never block.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canon::{Bounds, Direction, ThresholdCanon};
use crate::error::ThresholdError;

/// One raw result from the metric service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub name: String,
    pub value: f64,
    /// Bounds supplied with the result; these win over the canon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared: Option<Bounds>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl MetricResult {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            declared: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.declared = Some(bounds);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Classification band, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Pass,
    Warning,
    Halt,
}

impl Band {
    /// One-letter marker used in the context projection.
    pub fn marker(&self) -> char {
        match self {
            Band::Pass => 'P',
            Band::Warning => 'W',
            Band::Halt => 'H',
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Pass => write!(f, "pass"),
            Band::Warning => write!(f, "warning"),
            Band::Halt => write!(f, "halt"),
        }
    }
}

/// A metric result with its band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedMetric {
    pub name: String,
    pub value: f64,
    pub band: Band,
    /// Below the warning bound (or above it, for lower-is-better).
    #[serde(default)]
    pub near_floor: bool,
    pub bounds: Bounds,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// The banded form of one metric snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub classified: Vec<ClassifiedMetric>,
    /// Worst band in the snapshot.
    pub overall: Band,
    pub halted: bool,
    /// Consecutive snapshots (including this one) whose worst band was a
    /// warning. Informational only.
    #[serde(default)]
    pub warning_streak: u32,
}

impl MetricReport {
    /// Look up one classified metric by name.
    pub fn get(&self, name: &str) -> Option<&ClassifiedMetric> {
        self.classified.iter().find(|m| m.name == name)
    }

    /// Metrics in a given band.
    pub fn in_band(&self, band: Band) -> impl Iterator<Item = &ClassifiedMetric> {
        self.classified.iter().filter(move |m| m.band == band)
    }

    /// Continue the warning streak from the previous snapshot.
    pub fn with_prior_streak(mut self, prior: u32) -> Self {
        self.warning_streak = if self.overall == Band::Warning {
            prior.saturating_add(1)
        } else {
            0
        };
        self
    }
}

/// Classify a single value against bounds.
pub fn classify(value: f64, bounds: &Bounds) -> (Band, bool) {
    match bounds.direction {
        Direction::Higher => {
            if value >= bounds.pass {
                (Band::Pass, false)
            } else if value < bounds.halt {
                (Band::Halt, true)
            } else {
                (Band::Warning, value < bounds.warning)
            }
        }
        Direction::Lower => {
            if value <= bounds.pass {
                (Band::Pass, false)
            } else if value > bounds.halt {
                (Band::Halt, true)
            } else {
                (Band::Warning, value > bounds.warning)
            }
        }
    }
}

/// Bands metric snapshots against a threshold canon.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    canon: ThresholdCanon,
}

impl ThresholdEvaluator {
    pub fn new(canon: ThresholdCanon) -> Self {
        Self { canon }
    }

    pub fn canon(&self) -> &ThresholdCanon {
        &self.canon
    }

    /// Classify one result. Declared bounds take precedence over the canon.
    pub fn classify(&self, result: &MetricResult) -> Result<ClassifiedMetric, ThresholdError> {
        if !result.value.is_finite() {
            return Err(ThresholdError::NonFinite {
                name: result.name.clone(),
                value: result.value,
            });
        }
        let bounds = match result.declared {
            Some(declared) => {
                declared.validate(&result.name)?;
                declared
            }
            None => *self
                .canon
                .bounds(&result.name)
                .ok_or_else(|| ThresholdError::UnknownMetric(result.name.clone()))?,
        };
        let (band, near_floor) = classify(result.value, &bounds);
        Ok(ClassifiedMetric {
            name: result.name.clone(),
            value: result.value,
            band,
            near_floor,
            bounds,
            metadata: result.metadata.clone(),
        })
    }

    /// Band a whole snapshot. Any halt band halts the snapshot.
    pub fn evaluate(&self, results: &[MetricResult]) -> Result<MetricReport, ThresholdError> {
        if results.is_empty() {
            return Err(ThresholdError::EmptySnapshot);
        }
        let mut classified: Vec<ClassifiedMetric> = Vec::with_capacity(results.len());
        for result in results {
            if classified.iter().any(|c| c.name == result.name) {
                return Err(ThresholdError::DuplicateMetric(result.name.clone()));
            }
            classified.push(self.classify(result)?);
        }

        let overall = classified
            .iter()
            .map(|c| c.band)
            .max()
            .unwrap_or(Band::Pass);
        let halted = overall == Band::Halt;

        if halted {
            let names: Vec<&str> = classified
                .iter()
                .filter(|c| c.band == Band::Halt)
                .map(|c| c.name.as_str())
                .collect();
            tracing::warn!(metrics = ?names, "metric snapshot breached a halt floor");
        } else {
            tracing::debug!(overall = %overall, count = classified.len(), "metric snapshot banded");
        }

        Ok(MetricReport {
            classified,
            overall,
            halted,
            warning_streak: u32::from(overall == Band::Warning),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ThresholdEvaluator {
        ThresholdEvaluator::new(ThresholdCanon::default())
    }

    #[test]
    fn halt_floor_is_exclusive() {
        let bounds = Bounds::higher(0.80, 0.65, 0.50);
        assert_eq!(classify(0.4999, &bounds).0, Band::Halt);
        assert_eq!(classify(0.50, &bounds).0, Band::Warning);
        assert_eq!(classify(0.80, &bounds).0, Band::Pass);
    }

    #[test]
    fn near_floor_flag_marks_values_under_warning_bound() {
        let bounds = Bounds::higher(0.80, 0.65, 0.50);
        assert_eq!(classify(0.70, &bounds), (Band::Warning, false));
        assert_eq!(classify(0.60, &bounds), (Band::Warning, true));
    }

    #[test]
    fn lower_is_better_mirrors_banding() {
        let bounds = Bounds::lower(0.20, 0.35, 0.50);
        assert_eq!(classify(0.10, &bounds).0, Band::Pass);
        assert_eq!(classify(0.30, &bounds), (Band::Warning, false));
        assert_eq!(classify(0.40, &bounds), (Band::Warning, true));
        assert_eq!(classify(0.50, &bounds).0, Band::Warning);
        assert_eq!(classify(0.5001, &bounds).0, Band::Halt);
    }

    #[test]
    fn warning_and_pass_together_do_not_halt() {
        let report = evaluator()
            .evaluate(&[
                MetricResult::new("coherence", 0.70),
                MetricResult::new("evidence_strength", 0.90),
            ])
            .unwrap();
        assert!(!report.halted);
        assert_eq!(report.overall, Band::Warning);
        assert_eq!(report.get("coherence").unwrap().band, Band::Warning);
        assert_eq!(report.get("evidence_strength").unwrap().band, Band::Pass);
    }

    #[test]
    fn single_halt_halts_the_snapshot() {
        let report = evaluator()
            .evaluate(&[
                MetricResult::new("coherence", 0.95),
                MetricResult::new("scope_fidelity", 0.10),
            ])
            .unwrap();
        assert!(report.halted);
        assert_eq!(report.in_band(Band::Halt).count(), 1);
    }

    #[test]
    fn declared_bounds_override_canon() {
        let result =
            MetricResult::new("coherence", 0.55).with_bounds(Bounds::higher(0.50, 0.40, 0.30));
        let classified = evaluator().classify(&result).unwrap();
        assert_eq!(classified.band, Band::Pass);
    }

    #[test]
    fn unknown_metric_without_bounds_is_an_error() {
        let err = evaluator()
            .evaluate(&[MetricResult::new("novelty", 0.9)])
            .unwrap_err();
        assert!(matches!(err, ThresholdError::UnknownMetric(name) if name == "novelty"));

        let ok = evaluator()
            .evaluate(&[MetricResult::new("novelty", 0.9).with_bounds(Bounds::higher(0.8, 0.6, 0.4))])
            .unwrap();
        assert_eq!(ok.overall, Band::Pass);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for value in [f64::NAN, f64::INFINITY] {
            assert!(matches!(
                evaluator().classify(&MetricResult::new("coherence", value)),
                Err(ThresholdError::NonFinite { .. })
            ));
        }
    }

    #[test]
    fn empty_and_duplicate_snapshots_are_rejected() {
        assert!(matches!(
            evaluator().evaluate(&[]),
            Err(ThresholdError::EmptySnapshot)
        ));
        assert!(matches!(
            evaluator().evaluate(&[
                MetricResult::new("coherence", 0.9),
                MetricResult::new("coherence", 0.8),
            ]),
            Err(ThresholdError::DuplicateMetric(_))
        ));
    }

    #[test]
    fn warning_streak_counts_consecutive_warnings_only() {
        let ev = evaluator();
        let warn = ev
            .evaluate(&[MetricResult::new("coherence", 0.70)])
            .unwrap()
            .with_prior_streak(2);
        assert_eq!(warn.warning_streak, 3);
        assert!(!warn.halted);

        let pass = ev
            .evaluate(&[MetricResult::new("coherence", 0.90)])
            .unwrap()
            .with_prior_streak(3);
        assert_eq!(pass.warning_streak, 0);
    }
}
