//! # ks-graph
//!
//! Artifact dependency graph for Keystone.
//!
//! Every work-product of a run is an [`Artifact`]: a typed, content-hashed
//! body with a `parent_hash` link to its predecessor. Artifacts are
//! registered into an [`ArtifactGraph`], which keeps typed dependency edges
//! acyclic, freezes the critical path, and can scan itself for integrity
//! violations. On disk each artifact is an [`ArtifactEnvelope`] (YAML header
//! plus body) in an [`ArtifactStore`].
//!
//! ## Quick Example
//!
//! ```rust
//! use ks_graph::{Artifact, ArtifactGraph, ArtifactType, Relation};
//! use uuid::Uuid;
//!
//! let run_id = Uuid::new_v4();
//! let mut graph = ArtifactGraph::new(run_id);
//! let scope = Artifact::new(run_id, ArtifactType::ScopeStatement, 0, "scope", None, "me", "analyst");
//! let scope_id = graph.register(scope.clone()).unwrap();
//! let note = Artifact::new(run_id, ArtifactType::Evidence, 0, "obs", Some(scope.hash.clone()), "me", "analyst");
//! let note_id = graph.register(note).unwrap();
//! graph.add_edge(note_id, scope_id, Relation::ConstrainedBy).unwrap();
//! assert!(graph.add_edge(scope_id, note_id, Relation::References).is_err());
//! ```

pub mod artifact;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod store;

pub use artifact::{Artifact, ArtifactId, ArtifactType, Relation};
pub use envelope::{ArtifactEnvelope, DependencyRef, EnvelopeHeader};
pub use error::{GraphError, IntegrityViolation};
pub use graph::{ArtifactGraph, EdgeRecord, GraphCheckpoint, GraphIndex, IntegrityReport};
pub use store::{write_atomic, ArtifactStore};
