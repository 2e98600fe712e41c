//! Postgres-backed operation store.
//!
//! Concurrency-sensitive updates are single conditional statements, so
//! correctness does not depend on there being exactly one dispatcher:
//! - `claim` is `UPDATE ... WHERE status = 'pending'`; the winner is decided
//!   by `rows_affected`.
//! - `archive_and_delete` is one `WITH moved AS (DELETE ... RETURNING *)
//!   INSERT` statement, so a crash can never leave a row duplicated across
//!   the live and archive tables or lost between them.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use hostpilot_core::{
    Operation, OperationId, OperationSource, OperationStatus, TerminalOutcome,
};

use super::{OperationStats, OperationStore, OperationStoreError};

const OPERATION_COLUMNS: &str = "id, op_type, data, status, source, retry_count, error, result, created_at, started_at, completed_at";

/// Postgres store. `Clone` is cheap (shared pool).
#[derive(Debug, Clone)]
pub struct PostgresOperationStore {
    pool: Arc<PgPool>,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), OperationStoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| OperationStoreError::Storage(format!("migrate: {e}")))
    }

    async fn fetch(
        &self,
        table: &str,
        id: OperationId,
    ) -> Result<Option<Operation>, OperationStoreError> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM {table} WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch", e))?;

        row.map(Operation::try_from).transpose()
    }

    /// Distinguish "row is gone" from "row is in the wrong state" after a
    /// conditional update touched nothing.
    async fn transition_conflict(
        &self,
        id: OperationId,
        to: OperationStatus,
    ) -> OperationStoreError {
        match self.fetch("operations", id).await {
            Ok(Some(op)) => OperationStoreError::InvalidTransition {
                id,
                from: op.status,
                to,
            },
            Ok(None) => OperationStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
    #[instrument(skip(self, data), fields(op_type = %op_type, source = %source))]
    async fn enqueue(
        &self,
        op_type: &str,
        data: serde_json::Value,
        source: OperationSource,
    ) -> Result<Operation, OperationStoreError> {
        let op = Operation::new(op_type, data, source);

        sqlx::query(
            r#"
            INSERT INTO operations
                (id, op_type, data, status, source, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(op.id.as_uuid())
        .bind(&op.op_type)
        .bind(&op.data)
        .bind(op.status.as_str())
        .bind(op.source.as_str())
        .bind(op.retry_count as i32)
        .bind(op.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(op)
    }

    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError> {
        self.fetch("operations", id).await
    }

    async fn get_archived(
        &self,
        id: OperationId,
    ) -> Result<Option<Operation>, OperationStoreError> {
        self.fetch("operations_archive", id).await
    }

    #[instrument(skip(self), fields(operation = %id))]
    async fn claim(&self, id: OperationId) -> Result<bool, OperationStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'processing', started_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Lost race or already terminal: not an error. Missing row is.
        match self.fetch("operations", id).await? {
            Some(_) => Ok(false),
            None => Err(OperationStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self, outcome), fields(operation = %id))]
    async fn set_terminal(
        &self,
        id: OperationId,
        outcome: TerminalOutcome,
    ) -> Result<(), OperationStoreError> {
        let to = outcome.status();
        let (error, result) = match outcome {
            TerminalOutcome::Completed { result } => (None, Some(result)),
            TerminalOutcome::Failed { error } => (Some(error), None),
        };

        let updated = sqlx::query(
            r#"
            UPDATE operations
            SET status = $2, error = $3, result = $4, completed_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(error)
        .bind(result)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_terminal", e))?;

        if updated.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.transition_conflict(id, to).await)
        }
    }

    #[instrument(skip(self), fields(operation = %id))]
    async fn reset_for_retry(
        &self,
        id: OperationId,
        note: &str,
    ) -> Result<(), OperationStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'pending',
                retry_count = retry_count + 1,
                error = $2,
                started_at = NULL,
                completed_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(note)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_for_retry", e))?;

        if updated.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self
                .transition_conflict(id, OperationStatus::Pending)
                .await)
        }
    }

    async fn list_pending(
        &self,
        source: OperationSource,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE status = 'pending' AND source = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(source.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending", e))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    async fn list_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE status = 'processing' AND source = 'api' AND started_at < $1
            ORDER BY started_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stalled", e))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    async fn list_by_status(
        &self,
        status: OperationStatus,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM operations
            WHERE status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    async fn stats(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<OperationStats, OperationStoreError> {
        let (pending, processing, completed, failed, mean_secs): (
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                    FILTER (WHERE status = 'completed' AND completed_at >= $1)
                    ::double precision
            FROM operations
            "#,
        )
        .bind(window_start)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(OperationStats {
            pending: pending as u64,
            processing: processing as u64,
            completed: completed as u64,
            failed: failed as u64,
            mean_completed_duration_ms: mean_secs.map(|s| (s * 1000.0).max(0.0) as u64),
        })
    }

    #[instrument(skip(self))]
    async fn archive_and_delete(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, OperationStoreError> {
        let moved = sqlx::query(&format!(
            r#"
            WITH moved AS (
                DELETE FROM operations
                WHERE status IN ('completed', 'failed') AND completed_at < $1
                RETURNING {OPERATION_COLUMNS}
            )
            INSERT INTO operations_archive ({OPERATION_COLUMNS})
            SELECT {OPERATION_COLUMNS} FROM moved
            "#
        ))
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archive_and_delete", e))?;

        Ok(moved.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct OperationRow {
    id: Uuid,
    op_type: String,
    data: serde_json::Value,
    status: String,
    source: String,
    retry_count: i32,
    error: Option<String>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = OperationStoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let status = OperationStatus::from_str(&row.status)
            .map_err(|e| OperationStoreError::Storage(format!("corrupt row {}: {e}", row.id)))?;
        let source = OperationSource::from_str(&row.source)
            .map_err(|e| OperationStoreError::Storage(format!("corrupt row {}: {e}", row.id)))?;

        Ok(Operation {
            id: OperationId::from_uuid(row.id),
            op_type: row.op_type,
            data: row.data,
            status,
            source,
            retry_count: row.retry_count.max(0) as u32,
            error: row.error,
            result: row.result,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OperationStoreError {
    OperationStoreError::Storage(format!("{operation}: {err}"))
}
