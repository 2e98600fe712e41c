//! `hostpilot-core` — operation domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the persisted operation record, its status state machine, and the retry
//! policy shared by the dispatcher and the watchdog.

pub mod error;
pub mod id;
pub mod operation;
pub mod policy;

pub use error::{DomainError, DomainResult};
pub use id::OperationId;
pub use operation::{Operation, OperationSource, OperationStatus, TerminalOutcome};
pub use policy::RetryPolicy;
