//! # ks-metrics
//!
//! Threshold canon and metric banding for Keystone.
//!
//! A [`ThresholdCanon`] maps each quality metric to pass/warning/halt
//! [`Bounds`]. The [`ThresholdEvaluator`] bands a snapshot of
//! [`MetricResult`]s into a [`MetricReport`]; any halt band halts the
//! snapshot, warnings are recorded but never block.

pub mod canon;
pub mod error;
pub mod evaluator;

pub use canon::{Bounds, Direction, ThresholdCanon};
pub use error::ThresholdError;
pub use evaluator::{classify, Band, ClassifiedMetric, MetricReport, MetricResult, ThresholdEvaluator};
