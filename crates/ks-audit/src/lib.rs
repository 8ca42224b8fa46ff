//! # ks-audit
//!
//! The hash-chained ledger of a Keystone run.
//!
//! Every committed transition (artifact registrations, signals, gate
//! decisions, halts, drift pauses, stage moves, metric snapshots) is a
//! [`LedgerEntry`] in an append-only JSONL file. Each entry carries the hash
//! of its predecessor, so tampering anywhere in the file is detected on the
//! next [`Ledger::open`].
//!
//! The run's [`GovernanceState`](ks_policy::GovernanceState) is the fold of
//! its entries ([`fold::fold`]); requests are ruled on with
//! [`Ledger::propose`] before anything is appended.
//!
//! ## Quick Example
//!
//! ```rust
//! use ks_audit::{Ledger, Payload};
//! use ks_policy::{ExecutionMode, PermissionEngine, RoleTag};
//! use uuid::Uuid;
//!
//! let mut ledger = Ledger::in_memory(Uuid::new_v4(), PermissionEngine::default());
//! ledger.append(Payload::RunStarted {
//!     title: "pricing study".into(),
//!     role: RoleTag::Analyst,
//!     mode: ExecutionMode::Standard,
//!     started_by: "dana".into(),
//! }).unwrap();
//! assert!(ledger.state().started);
//! assert!(ledger.verify_chain().is_ok());
//! ```

pub mod entry;
pub mod error;
pub mod fold;
pub mod ledger;

pub use entry::{EntryType, LedgerEntry, Payload};
pub use error::LedgerError;
pub use ledger::Ledger;
