//! In-memory operation store for dev mode and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hostpilot_core::{
    DomainError, Operation, OperationId, OperationSource, OperationStatus, TerminalOutcome,
};

use super::{OperationStats, OperationStore, OperationStoreError};

/// In-memory store. Claim atomicity comes from performing the compare-and-set
/// inside one write-lock critical section; the archive move takes both locks
/// so rows can never be visible in neither (or both) tables.
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    live: RwLock<HashMap<OperationId, Operation>>,
    archive: RwLock<HashMap<OperationId, Operation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn apply<F>(&self, id: OperationId, mutate: F) -> Result<(), OperationStoreError>
    where
        F: FnOnce(&mut Operation) -> Result<(), DomainError>,
    {
        let mut live = self.live.write().unwrap();
        let op = live
            .get_mut(&id)
            .ok_or(OperationStoreError::NotFound(id))?;
        mutate(op).map_err(|e| domain_to_store_error(id, e))
    }
}

fn domain_to_store_error(id: OperationId, err: DomainError) -> OperationStoreError {
    match err {
        DomainError::InvalidTransition { from, to } => {
            OperationStoreError::InvalidTransition { id, from, to }
        }
        other => OperationStoreError::Storage(other.to_string()),
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn enqueue(
        &self,
        op_type: &str,
        data: serde_json::Value,
        source: OperationSource,
    ) -> Result<Operation, OperationStoreError> {
        let op = Operation::new(op_type, data, source);
        let mut live = self.live.write().unwrap();
        live.insert(op.id, op.clone());
        Ok(op)
    }

    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError> {
        Ok(self.live.read().unwrap().get(&id).cloned())
    }

    async fn get_archived(
        &self,
        id: OperationId,
    ) -> Result<Option<Operation>, OperationStoreError> {
        Ok(self.archive.read().unwrap().get(&id).cloned())
    }

    async fn claim(&self, id: OperationId) -> Result<bool, OperationStoreError> {
        let mut live = self.live.write().unwrap();
        let op = live
            .get_mut(&id)
            .ok_or(OperationStoreError::NotFound(id))?;
        if op.status != OperationStatus::Pending {
            return Ok(false);
        }
        op.mark_processing(Utc::now())
            .map_err(|e| domain_to_store_error(id, e))?;
        Ok(true)
    }

    async fn set_terminal(
        &self,
        id: OperationId,
        outcome: TerminalOutcome,
    ) -> Result<(), OperationStoreError> {
        self.apply(id, |op| op.mark_terminal(outcome, Utc::now()))
    }

    async fn reset_for_retry(
        &self,
        id: OperationId,
        note: &str,
    ) -> Result<(), OperationStoreError> {
        self.apply(id, |op| op.reset_for_retry(note, Utc::now()))
    }

    async fn list_pending(
        &self,
        source: OperationSource,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let live = self.live.read().unwrap();
        let mut pending: Vec<_> = live
            .values()
            .filter(|op| op.status == OperationStatus::Pending && op.source == source)
            .cloned()
            .collect();
        pending.sort_by_key(|op| (op.created_at, op.id.to_string()));
        Ok(pending)
    }

    async fn list_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let live = self.live.read().unwrap();
        let mut stalled: Vec<_> = live
            .values()
            .filter(|op| {
                op.status == OperationStatus::Processing
                    && op.source == OperationSource::Api
                    && op.started_at.is_some_and(|s| s < cutoff)
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|op| op.started_at);
        Ok(stalled)
    }

    async fn list_by_status(
        &self,
        status: OperationStatus,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let live = self.live.read().unwrap();
        let mut result: Vec<_> = live
            .values()
            .filter(|op| op.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|op| std::cmp::Reverse(op.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<OperationStats, OperationStoreError> {
        let live = self.live.read().unwrap();
        let mut stats = OperationStats::default();
        let mut runtimes_ms: Vec<i64> = Vec::new();

        for op in live.values() {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Processing => stats.processing += 1,
                OperationStatus::Completed => {
                    stats.completed += 1;
                    if op.completed_at.is_some_and(|c| c >= window_start) {
                        if let Some(runtime) = op.runtime() {
                            runtimes_ms.push(runtime.num_milliseconds().max(0));
                        }
                    }
                }
                OperationStatus::Failed => stats.failed += 1,
            }
        }

        if !runtimes_ms.is_empty() {
            let sum: i64 = runtimes_ms.iter().sum();
            stats.mean_completed_duration_ms = Some((sum / runtimes_ms.len() as i64) as u64);
        }
        Ok(stats)
    }

    async fn archive_and_delete(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, OperationStoreError> {
        let mut live = self.live.write().unwrap();
        let mut archive = self.archive.write().unwrap();

        let evict: Vec<OperationId> = live
            .values()
            .filter(|op| op.is_terminal() && op.completed_at.is_some_and(|c| c < older_than))
            .map(|op| op.id)
            .collect();

        let mut moved = 0u64;
        for id in evict {
            if let Some(op) = live.remove(&id) {
                archive.insert(id, op);
                moved += 1;
            }
        }
        Ok(moved)
    }
}
