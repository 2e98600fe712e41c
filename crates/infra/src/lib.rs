//! `hostpilot-infra` — operation store, handler plumbing, and the two
//! orchestration loops.
//!
//! Layout:
//! - [`store`]: the [`store::OperationStore`] trait plus in-memory and
//!   Postgres implementations.
//! - [`registry`]: the load-once `op_type → handler command` mapping.
//! - [`handler`]: external handler process invocation.
//! - [`dispatcher`]: the polling loop that claims and executes pending work.
//! - [`watchdog`]: stall recovery, daily statistics, and archival.

pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod store;
pub mod watchdog;
