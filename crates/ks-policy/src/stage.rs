// stage.rs — The fixed pipeline of stages.
//
//   intake(0) → framing(1) → baseline(2) → analysis(3) → synthesis(4)
//     → validation(5) → reporting(6) → closure(7, terminal)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Framing,
    Baseline,
    Analysis,
    Synthesis,
    Validation,
    Reporting,
    Closure,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Intake,
        Stage::Framing,
        Stage::Baseline,
        Stage::Analysis,
        Stage::Synthesis,
        Stage::Validation,
        Stage::Reporting,
        Stage::Closure,
    ];

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn from_index(index: u8) -> Option<Stage> {
        Self::ALL.get(index as usize).copied()
    }

    /// The stage after this one; `None` at closure.
    pub fn next(&self) -> Option<Stage> {
        Self::from_index(self.index() + 1)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Stage::Closure
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Framing => "framing",
            Stage::Baseline => "baseline",
            Stage::Analysis => "analysis",
            Stage::Synthesis => "synthesis",
            Stage::Validation => "validation",
            Stage::Reporting => "reporting",
            Stage::Closure => "closure",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = PolicyError;

    /// Accepts either the stage name or its index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(index) = s.parse::<u8>() {
            return Stage::from_index(index).ok_or_else(|| PolicyError::UnknownStage(s.to_string()));
        }
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| PolicyError::UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered_and_indexed() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index() as usize, i);
        }
        assert_eq!(Stage::Intake.next(), Some(Stage::Framing));
        assert_eq!(Stage::Reporting.next(), Some(Stage::Closure));
        assert_eq!(Stage::Closure.next(), None);
        assert!(Stage::Baseline < Stage::Analysis);
    }

    #[test]
    fn parse_by_name_or_index() {
        assert_eq!("synthesis".parse::<Stage>().unwrap(), Stage::Synthesis);
        assert_eq!("2".parse::<Stage>().unwrap(), Stage::Baseline);
        assert!("9".parse::<Stage>().is_err());
        assert!("design".parse::<Stage>().is_err());
    }
}
