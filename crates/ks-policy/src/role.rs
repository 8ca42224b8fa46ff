// role.rs — Role records and the role book.
//
// A role is a flat capability record: which dotted operation names it may
// perform (`permitted`) and which it may never perform (`forbidden`), both
// as glob patterns. Forbidden wins; an operation matching neither list is
// denied.
//
// The built-in records can be overridden per project by a YAML role book:
//
//   - tag: observer
//     abbreviation: OB
//     summary: Watches metrics and reads the graph.
//     permitted: ["graph.read", "ledger.read", "metric.evaluate"]
//     forbidden: ["artifact.*"]

use std::fmt;
use std::fs;
use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::action::Operation;
use crate::error::PolicyError;

/// The closed set of roles.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RoleTag {
    #[default]
    Analyst,
    Observer,
    Coordinator,
    Auditor,
}

impl RoleTag {
    pub const ALL: [RoleTag; 4] = [
        RoleTag::Analyst,
        RoleTag::Observer,
        RoleTag::Coordinator,
        RoleTag::Auditor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RoleTag::Analyst => "analyst",
            RoleTag::Observer => "observer",
            RoleTag::Coordinator => "coordinator",
            RoleTag::Auditor => "auditor",
        }
    }

    /// Two-letter form used in the context projection.
    pub fn abbreviation(&self) -> &'static str {
        match self {
            RoleTag::Analyst => "AN",
            RoleTag::Observer => "OB",
            RoleTag::Coordinator => "CO",
            RoleTag::Auditor => "AU",
        }
    }
}

impl fmt::Display for RoleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RoleTag {
    type Err = PolicyError;

    /// Accepts the name or the abbreviation, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        RoleTag::ALL
            .iter()
            .copied()
            .find(|r| r.name() == wanted || r.abbreviation().eq_ignore_ascii_case(s))
            .ok_or_else(|| PolicyError::UnknownRole(s.to_string()))
    }
}

/// Capability record for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    pub tag: RoleTag,
    pub abbreviation: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
}

/// How an operation fared against a role's patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMatch {
    Forbidden(String),
    Permitted(String),
    Unlisted,
}

impl RoleRecord {
    fn new(tag: RoleTag, summary: &str, permitted: &[&str], forbidden: &[&str]) -> Self {
        Self {
            tag,
            abbreviation: tag.abbreviation().to_string(),
            summary: summary.to_string(),
            permitted: permitted.iter().map(|p| p.to_string()).collect(),
            forbidden: forbidden.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Built-in record for a role.
    pub fn builtin(tag: RoleTag) -> Self {
        match tag {
            RoleTag::Analyst => Self::new(
                tag,
                "Produces and links artifacts and drives the stage pipeline.",
                &["*"],
                &[],
            ),
            RoleTag::Observer => Self::new(
                tag,
                "Watches metrics, reads the graph, may flag drift or halt.",
                &[
                    "graph.read",
                    "ledger.read",
                    "integrity.validate",
                    "metric.evaluate",
                    "signal.notify",
                    "drift.report",
                    "halt.immediate",
                    "generation.request",
                ],
                &["artifact.*", "scope.*", "stage.*", "baseline.*", "graph.link"],
            ),
            RoleTag::Coordinator => Self::new(
                tag,
                "Moves the run between stages; annotates but does not author.",
                &[
                    "graph.read",
                    "ledger.read",
                    "integrity.validate",
                    "metric.evaluate",
                    "signal.*",
                    "stage.*",
                    "artifact.annotate",
                    "drift.report",
                    "halt.immediate",
                    "run.close",
                ],
                &[
                    "artifact.produce",
                    "artifact.supersede",
                    "artifact.edit",
                    "scope.change",
                    "baseline.freeze",
                    "graph.link",
                    "generation.request",
                ],
            ),
            RoleTag::Auditor => Self::new(
                tag,
                "Verifies chains and integrity; never authors content.",
                &[
                    "graph.read",
                    "ledger.read",
                    "integrity.validate",
                    "metric.evaluate",
                    "signal.notify",
                    "drift.report",
                    "halt.immediate",
                ],
                &["artifact.*", "generation.request", "signal.propose"],
            ),
        }
    }

    /// Check every pattern parses. Invalid patterns would never match
    /// (fail-closed), but a role book with one is rejected up front.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for pattern in self.permitted.iter().chain(self.forbidden.iter()) {
            Pattern::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                role: self.tag.to_string(),
                pattern: pattern.clone(),
                reason: e.msg.to_string(),
            })?;
        }
        Ok(())
    }

    /// Match an operation: forbidden patterns first, then permitted.
    pub fn check(&self, operation: Operation) -> RoleMatch {
        let name = operation.name();
        if let Some(p) = self.forbidden.iter().find(|p| matches_pattern(p, name)) {
            return RoleMatch::Forbidden(p.clone());
        }
        if let Some(p) = self.permitted.iter().find(|p| matches_pattern(p, name)) {
            return RoleMatch::Permitted(p.clone());
        }
        RoleMatch::Unlisted
    }

    pub fn allows(&self, operation: Operation) -> bool {
        matches!(self.check(operation), RoleMatch::Permitted(_))
    }

    /// Text block describing the role's limits, for inclusion in external
    /// generation instructions.
    pub fn constraint_block(&self) -> String {
        let list = |patterns: &[String]| {
            if patterns.is_empty() {
                "(none)".to_string()
            } else {
                patterns.join(", ")
            }
        };
        format!(
            "[role {} ({})]\n{}\npermitted: {}\nforbidden: {}\n",
            self.tag,
            self.abbreviation,
            self.summary,
            list(&self.permitted),
            list(&self.forbidden)
        )
    }
}

/// Glob match over an operation name. Invalid patterns never match.
fn matches_pattern(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => false,
    }
}

/// The role records in force for a project, indexed by `RoleTag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBook {
    records: [RoleRecord; 4],
}

impl Default for RoleBook {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RoleBook {
    pub fn builtin() -> Self {
        Self {
            records: RoleTag::ALL.map(RoleRecord::builtin),
        }
    }

    /// Parse a YAML list of role records; each replaces the built-in record
    /// with the same tag.
    pub fn from_yaml_str(text: &str) -> Result<Self, PolicyError> {
        let overrides: Vec<RoleRecord> = serde_yaml::from_str(text)?;
        let mut book = Self::builtin();
        for record in overrides {
            record.validate()?;
            let slot = record.tag as usize;
            book.records[slot] = record;
        }
        Ok(book)
    }

    /// Load the role book at `path`, or the built-ins if it does not exist.
    pub fn load_or_builtin(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(path).map_err(|source| PolicyError::RoleBookIo {
            path: path.to_path_buf(),
            source,
        })?;
        let book = Self::from_yaml_str(&text)?;
        tracing::info!(path = %path.display(), "loaded role book");
        Ok(book)
    }

    pub fn get(&self, tag: RoleTag) -> &RoleRecord {
        &self.records[tag as usize]
    }

    pub fn records(&self) -> impl Iterator<Item = &RoleRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_wins_over_permitted() {
        let record = RoleRecord {
            tag: RoleTag::Observer,
            abbreviation: "OB".into(),
            summary: String::new(),
            permitted: vec!["*".into()],
            forbidden: vec!["artifact.*".into()],
        };
        assert_eq!(
            record.check(Operation::ArtifactProduce),
            RoleMatch::Forbidden("artifact.*".into())
        );
        assert!(record.allows(Operation::GraphRead));
    }

    #[test]
    fn unlisted_operations_are_not_allowed() {
        let auditor = RoleRecord::builtin(RoleTag::Auditor);
        assert_eq!(auditor.check(Operation::StageAdvance), RoleMatch::Unlisted);
        assert!(!auditor.allows(Operation::StageAdvance));
    }

    #[test]
    fn builtin_roles_match_their_summaries() {
        let analyst = RoleRecord::builtin(RoleTag::Analyst);
        let observer = RoleRecord::builtin(RoleTag::Observer);
        let coordinator = RoleRecord::builtin(RoleTag::Coordinator);
        let auditor = RoleRecord::builtin(RoleTag::Auditor);

        assert!(analyst.allows(Operation::ArtifactProduce));
        assert!(analyst.allows(Operation::GraphLink));
        assert!(!observer.allows(Operation::ArtifactProduce));
        assert!(observer.allows(Operation::MetricEvaluate));
        assert!(coordinator.allows(Operation::StageAdvance));
        assert!(coordinator.allows(Operation::ArtifactAnnotate));
        assert!(!coordinator.allows(Operation::ArtifactSupersede));
        assert!(auditor.allows(Operation::IntegrityValidate));
        assert!(!auditor.allows(Operation::SignalPropose));
    }

    #[test]
    fn role_tag_parses_name_or_abbreviation() {
        assert_eq!("coordinator".parse::<RoleTag>().unwrap(), RoleTag::Coordinator);
        assert_eq!("AU".parse::<RoleTag>().unwrap(), RoleTag::Auditor);
        assert_eq!("an".parse::<RoleTag>().unwrap(), RoleTag::Analyst);
        assert!("editor".parse::<RoleTag>().is_err());
    }

    #[test]
    fn yaml_override_replaces_one_role() {
        let book = RoleBook::from_yaml_str(
            r#"
- tag: auditor
  abbreviation: AU
  summary: Read-only.
  permitted: ["ledger.read"]
"#,
        )
        .unwrap();
        assert!(!book.get(RoleTag::Auditor).allows(Operation::GraphRead));
        assert!(book.get(RoleTag::Auditor).allows(Operation::LedgerRead));
        assert_eq!(
            book.get(RoleTag::Analyst),
            &RoleRecord::builtin(RoleTag::Analyst)
        );
    }

    #[test]
    fn invalid_pattern_rejects_role_book() {
        let err = RoleBook::from_yaml_str(
            r#"
- tag: analyst
  abbreviation: AN
  permitted: ["artifact.[produce"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }

    #[test]
    fn constraint_block_lists_both_sets() {
        let block = RoleRecord::builtin(RoleTag::Auditor).constraint_block();
        assert!(block.starts_with("[role auditor (AU)]"));
        assert!(block.contains("permitted: graph.read, ledger.read"));
        assert!(block.contains("forbidden: artifact.*, generation.request, signal.propose"));

        let analyst = RoleRecord::builtin(RoleTag::Analyst).constraint_block();
        assert!(analyst.contains("forbidden: (none)"));
    }

    #[test]
    fn role_book_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.yaml");
        assert_eq!(RoleBook::load_or_builtin(&path).unwrap(), RoleBook::builtin());

        fs::write(
            &path,
            "- tag: observer\n  abbreviation: OB\n  permitted: [\"graph.read\"]\n",
        )
        .unwrap();
        let book = RoleBook::load_or_builtin(&path).unwrap();
        assert!(book.get(RoleTag::Observer).allows(Operation::GraphRead));
        assert!(!book.get(RoleTag::Observer).allows(Operation::LedgerRead));
    }
}
