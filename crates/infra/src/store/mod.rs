//! Operation storage.
//!
//! The store is the single shared mutable resource: the producer boundary,
//! the dispatcher, and the watchdog coordinate exclusively through its
//! single-row updates. `claim` is the linchpin — it must be an atomic
//! compare-and-set so a `pending` row can be won by at most one caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use hostpilot_core::{Operation, OperationId, OperationSource, OperationStatus, TerminalOutcome};

mod memory;
mod postgres;

pub use memory::InMemoryOperationStore;
pub use postgres::PostgresOperationStore;

/// Operation store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationStoreError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),
    #[error("operation {id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Aggregate counts plus the mean runtime of operations completed inside the
/// reporting window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub mean_completed_duration_ms: Option<u64>,
}

/// Persistence contract for operations and their archive.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a fresh `pending` row. No registry validation happens here;
    /// unknown types surface at dispatch time.
    async fn enqueue(
        &self,
        op_type: &str,
        data: serde_json::Value,
        source: OperationSource,
    ) -> Result<Operation, OperationStoreError>;

    /// Fetch a live row.
    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError>;

    /// Fetch an archived row.
    async fn get_archived(
        &self,
        id: OperationId,
    ) -> Result<Option<Operation>, OperationStoreError>;

    /// Atomic compare-and-set `pending → processing`, stamping `started_at`.
    ///
    /// Returns `Ok(false)` when the row was not `pending` — a lost claim race
    /// is a normal outcome, not an error.
    async fn claim(&self, id: OperationId) -> Result<bool, OperationStoreError>;

    /// Finish a `processing` row, stamping `completed_at`.
    async fn set_terminal(
        &self,
        id: OperationId,
        outcome: TerminalOutcome,
    ) -> Result<(), OperationStoreError>;

    /// Return a `processing` row to `pending` for another attempt,
    /// incrementing `retry_count` and recording `note` in `error`.
    async fn reset_for_retry(
        &self,
        id: OperationId,
        note: &str,
    ) -> Result<(), OperationStoreError>;

    /// `pending` rows for one source, oldest first (dispatch order).
    async fn list_pending(
        &self,
        source: OperationSource,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// `processing`, `source=api` rows whose `started_at` is older than
    /// `cutoff`, oldest first.
    async fn list_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// Rows in one status, newest first, at most `limit`.
    async fn list_by_status(
        &self,
        status: OperationStatus,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// Per-status totals; mean completed runtime restricted to rows that
    /// completed at or after `window_start`.
    async fn stats(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<OperationStats, OperationStoreError>;

    /// Move every terminal row that finished before `older_than` into the
    /// archive and delete it from the live table, as one atomic unit.
    /// Returns the number of rows moved.
    async fn archive_and_delete(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, OperationStoreError>;
}
