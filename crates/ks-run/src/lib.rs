//! # ks-run
//!
//! Drives Keystone runs.
//!
//! A [`Session`] owns one run: its [`ArtifactGraph`](ks_graph::ArtifactGraph),
//! its [`Ledger`](ks_audit::Ledger) and its signal chain. Every operation is
//! proposed to the permission engine, applied, and then recorded; a run's
//! history is its ledger.
//!
//! ## Key components
//!
//! - [`Session`] — start, resume and drive a run through its eight stages
//! - [`SignalGateController`] — hash-linked signals and human gate decisions
//! - [`RunStore`] — run directories, snapshots and the archive
//! - [`SessionHandle`] — shared session with a lock-free committed view and
//!   background autosave
//! - [`EventDispatcher`] — notification sinks for gates, halts and closure
//! - [`context_line`] — the one-line context projection
//!
//! ## Quick Example
//!
//! ```rust
//! use ks_graph::ArtifactType;
//! use ks_policy::{GateDecision, Stage};
//! use ks_run::{Session, SessionOptions};
//!
//! let mut session = Session::in_memory("pricing study", "dana", SessionOptions::default()).unwrap();
//! session.produce_artifact(ArtifactType::ScopeStatement, "Which tiers to reprice?", &[]).unwrap();
//! session.propose_advance().unwrap();
//! session.resolve_gate(GateDecision::Approve, "dana", None).unwrap();
//! assert_eq!(session.advance_stage().unwrap(), Stage::Framing);
//! ```

pub mod collaborator;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod projection;
pub mod run;
pub mod session;
pub mod signal;
pub mod store;

pub use collaborator::{
    CollaboratorError, GenerationRequest, GenerationService, MetricRequest, MetricService,
    RetryPolicy,
};
pub use config::{KeystoneConfig, Settings};
pub use error::{ErrorKind, RunError};
pub use events::{EventDispatcher, KsEvent, LogSink, NotificationSink};
pub use handle::{AutosaveTask, CommittedView, SessionHandle};
pub use projection::context_line;
pub use run::{Run, RunStatus};
pub use session::{IntegrityCheck, PendingEvaluation, PendingGeneration, Session, SessionOptions};
pub use signal::{Signal, SignalGateController, SignalStatus, SignalType};
pub use store::{RunLocation, RunSnapshot, RunStore};
