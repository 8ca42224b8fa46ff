// collaborator.rs — Seams for the external services a run calls out to.
//
// Content generation and metric scoring happen outside Keystone. The
// session only sees these traits: it builds a request, calls the service
// without holding the session lock, and re-validates the result against the
// committed state when it comes back.

use std::time::Duration;

use ks_graph::ArtifactType;
use ks_metrics::MetricResult;
use ks_policy::{RoleTag, Stage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::RunError;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Transient: the service could not be reached or is overloaded.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// Transient: the call took too long.
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    /// Permanent: the service refused the request.
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),

    /// Permanent: the response could not be used.
    #[error("invalid collaborator response: {0}")]
    InvalidResponse(String),
}

impl CollaboratorError {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unavailable(_) | CollaboratorError::Timeout(_)
        )
    }
}

/// Request for generated artifact content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub run_id: Uuid,
    pub stage: Stage,
    pub role: RoleTag,
    pub artifact_type: ArtifactType,
    /// What to produce.
    pub instruction: String,
    /// The role's constraint block; passed through verbatim.
    pub constraints: String,
    /// Context projection line at the time of the request.
    pub context: String,
}

/// Request to score artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRequest {
    pub run_id: Uuid,
    pub stage: Stage,
    /// `(artifact_id, body)` pairs to score.
    pub artifacts: Vec<(ks_graph::ArtifactId, String)>,
    pub context: String,
}

/// Produces artifact content.
pub trait GenerationService: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String, CollaboratorError>;
}

/// Scores artifacts into metric results.
pub trait MetricService: Send + Sync {
    fn evaluate(&self, request: &MetricRequest) -> Result<Vec<MetricResult>, CollaboratorError>;
}

/// How many times to try a collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Call `f` until it succeeds, fails permanently, or attempts run out.
    /// `f` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        mut f: impl FnMut(u32) -> Result<T, CollaboratorError>,
    ) -> Result<T, RunError> {
        let attempts = self.max_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match f(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, max = attempts, error = %e, "collaborator call failed, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(RunError::Collaborator(e)),
            }
        }
        Err(RunError::RetriesExhausted {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_transient_failures() {
        let policy = RetryPolicy::new(3);
        let result = policy.run(|attempt| {
            if attempt < 3 {
                Err(CollaboratorError::Unavailable("busy".into()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut calls = 0;
        let err = RetryPolicy::new(2)
            .run::<()>(|_| {
                calls += 1;
                Err(CollaboratorError::Timeout(Duration::from_secs(5)))
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(err, RunError::RetriesExhausted { attempts: 2, .. }));
    }

    #[test]
    fn permanent_failure_stops_immediately() {
        let mut calls = 0;
        let err = RetryPolicy::default()
            .run::<()>(|_| {
                calls += 1;
                Err(CollaboratorError::Rejected("policy".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, RunError::Collaborator(CollaboratorError::Rejected(_))));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
