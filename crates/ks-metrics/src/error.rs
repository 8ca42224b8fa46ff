// error.rs — Error types for threshold loading and metric evaluation.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThresholdError {
    /// A metric value was NaN or infinite.
    #[error("metric '{name}' has non-finite value {value}")]
    NonFinite { name: String, value: f64 },

    /// No bounds were declared and the canon does not know the metric.
    #[error("metric '{0}' has no declared bounds and is not in the threshold canon")]
    UnknownMetric(String),

    /// Bounds are out of order for their direction, or not finite.
    #[error("invalid bounds for metric '{name}': {reason}")]
    InvalidBounds { name: String, reason: String },

    /// A snapshot must contain at least one metric.
    #[error("metric snapshot is empty")]
    EmptySnapshot,

    /// The same metric appears twice in one snapshot.
    #[error("metric '{0}' appears more than once in the snapshot")]
    DuplicateMetric(String),

    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse threshold canon: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render threshold canon: {0}")]
    Render(#[from] toml::ser::Error),
}
