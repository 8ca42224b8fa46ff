//! # ks-policy
//!
//! Stages, roles and the permission state machine for Keystone.
//!
//! Every operation on a run is first submitted as an [`ActionRequest`] and
//! ruled on by the [`PermissionEngine`] against the run's
//! [`GovernanceState`]. The engine is a pure function: it returns
//! [`Decision::Allow`] or [`Decision::Deny`] with a typed [`DenialReason`]
//! and never has side effects.
//!
//! ## Key invariants
//!
//! - **Default deny**: an operation that no pattern of the active role
//!   permits is denied; forbidden patterns win over permitted ones.
//! - **Human gates**: `gate.resolve`, `halt.resolve`, `drift.resolve`,
//!   `scope.adjust`, `role.switch` and `mode.set` need a human identity.
//! - **Waiting states block work**: while a gate is pending, the run is
//!   halted or paused, only reads and the matching human decision pass.

pub mod action;
pub mod engine;
pub mod error;
pub mod role;
pub mod stage;
pub mod state;

pub use action::{ActionRequest, Actor, Operation};
pub use engine::{Decision, DenialReason, EvaluationStep, EvaluationTrace, PermissionEngine};
pub use error::PolicyError;
pub use role::{RoleBook, RoleMatch, RoleRecord, RoleTag};
pub use stage::Stage;
pub use state::{
    Adjustment, DriftChoice, ExecutionMode, GateDecision, GateRef, GovernanceState, HaltChoice,
    HaltSource, HaltState, PauseState, RunOutcome, SignalMark,
};
