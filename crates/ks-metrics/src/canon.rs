// canon.rs — The threshold canon: per-metric pass/warning/halt bounds.
//
// The canon is a small versioned TOML document:
//
//   version = "1"
//
//   [metrics.coherence]
//   pass = 0.80
//   warning = 0.65
//   halt = 0.50
//
//   [metrics.redundancy]
//   pass = 0.20
//   warning = 0.35
//   halt = 0.50
//   direction = "lower"
//
// It is read once at startup. A missing file means "use the defaults below";
// a file that exists but does not parse or validate is an error, never a
// silent fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ThresholdError;

/// Which side of the bounds is good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Larger values are better; halt when the value falls below the floor.
    #[default]
    Higher,
    /// Smaller values are better; halt when the value rises above the ceiling.
    Lower,
}

/// Band edges for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub pass: f64,
    pub warning: f64,
    pub halt: f64,
    #[serde(default)]
    pub direction: Direction,
}

impl Bounds {
    pub fn higher(pass: f64, warning: f64, halt: f64) -> Self {
        Self {
            pass,
            warning,
            halt,
            direction: Direction::Higher,
        }
    }

    pub fn lower(pass: f64, warning: f64, halt: f64) -> Self {
        Self {
            pass,
            warning,
            halt,
            direction: Direction::Lower,
        }
    }

    /// Check the bounds are finite and ordered for their direction:
    /// `halt <= warning <= pass` (higher) or `pass <= warning <= halt` (lower).
    pub fn validate(&self, name: &str) -> Result<(), ThresholdError> {
        let invalid = |reason: String| ThresholdError::InvalidBounds {
            name: name.to_string(),
            reason,
        };
        if ![self.pass, self.warning, self.halt]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(invalid("bounds must be finite numbers".into()));
        }
        let ordered = match self.direction {
            Direction::Higher => self.halt <= self.warning && self.warning <= self.pass,
            Direction::Lower => self.pass <= self.warning && self.warning <= self.halt,
        };
        if !ordered {
            return Err(invalid(format!(
                "expected {} (pass={}, warning={}, halt={})",
                match self.direction {
                    Direction::Higher => "halt <= warning <= pass",
                    Direction::Lower => "pass <= warning <= halt",
                },
                self.pass,
                self.warning,
                self.halt
            )));
        }
        Ok(())
    }
}

/// Versioned mapping from metric name to bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCanon {
    pub version: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, Bounds>,
}

impl Default for ThresholdCanon {
    /// The documented defaults used when no canon file exists.
    fn default() -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert("coherence".to_string(), Bounds::higher(0.80, 0.65, 0.50));
        metrics.insert(
            "evidence_strength".to_string(),
            Bounds::higher(0.75, 0.60, 0.45),
        );
        metrics.insert(
            "scope_fidelity".to_string(),
            Bounds::higher(0.85, 0.70, 0.55),
        );
        metrics.insert("redundancy".to_string(), Bounds::lower(0.20, 0.35, 0.50));
        Self {
            version: default_version(),
            metrics,
        }
    }
}

fn default_version() -> String {
    "1".to_string()
}

impl ThresholdCanon {
    /// Parse and validate a canon from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ThresholdError> {
        let canon: ThresholdCanon = toml::from_str(text)?;
        canon.validate()?;
        Ok(canon)
    }

    /// Load the canon at `path`, or the defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ThresholdError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no threshold canon file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ThresholdError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let canon = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            version = %canon.version,
            metrics = canon.metrics.len(),
            "loaded threshold canon"
        );
        Ok(canon)
    }

    /// Validate every metric's bounds.
    pub fn validate(&self) -> Result<(), ThresholdError> {
        for (name, bounds) in &self.metrics {
            bounds.validate(name)?;
        }
        Ok(())
    }

    pub fn bounds(&self, name: &str) -> Option<&Bounds> {
        self.metrics.get(name)
    }

    pub fn to_toml_string(&self) -> Result<String, ThresholdError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
