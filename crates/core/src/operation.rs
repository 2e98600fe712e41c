//! The persisted operation record and its status state machine.
//!
//! An [`Operation`] is one unit of asynchronous administrative work (create a
//! site, issue a certificate, ...). It moves through
//! `pending → processing → {completed, failed}`, optionally looping back to
//! `pending` when the dispatcher or the watchdog resets it for another
//! attempt. Transition helpers here are the single place the legality of a
//! move is decided; the stores call into them (in-memory) or mirror them in
//! SQL (postgres).

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::OperationId;

/// Lifecycle status of an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued, waiting to be claimed by the dispatcher.
    Pending,
    /// Claimed; the external handler is (believed to be) running.
    Processing,
    /// Handler finished successfully. Terminal.
    Completed,
    /// Handler failed permanently or retries were exhausted. Terminal.
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl core::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Who created an operation.
///
/// `Api` rows are owned by this subsystem. `Ui` rows belong to a pre-existing
/// orchestration path that shares the table for visibility only; the
/// dispatcher never claims them and the watchdog never retries them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationSource {
    Api,
    Ui,
}

impl OperationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationSource::Api => "api",
            OperationSource::Ui => "ui",
        }
    }
}

impl core::fmt::Display for OperationSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(OperationSource::Api),
            "ui" => Ok(OperationSource::Ui),
            other => Err(DomainError::InvalidSource(other.to_string())),
        }
    }
}

/// How an operation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Completed { result: serde_json::Value },
    Failed { error: String },
}

impl TerminalOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self::Completed { result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn status(&self) -> OperationStatus {
        match self {
            TerminalOutcome::Completed { .. } => OperationStatus::Completed,
            TerminalOutcome::Failed { .. } => OperationStatus::Failed,
        }
    }
}

/// One unit of asynchronous work, as persisted in the operation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Store-assigned identifier, immutable.
    pub id: OperationId,
    /// Namespaced action string, e.g. `"site.create"`. Routes to a handler.
    pub op_type: String,
    /// Opaque payload; interpreted only by the handler.
    pub data: serde_json::Value,
    pub status: OperationStatus,
    /// Set at creation, never mutated.
    pub source: OperationSource,
    /// Number of resets back to `pending`. Monotone, bounded by the retry
    /// policy before a row may fail through exhaustion.
    pub retry_count: u32,
    /// Failure message, or the note recorded by the most recent reset.
    pub error: Option<String>,
    /// Handler-reported result; always set on `completed`.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Set exactly when the status enters `processing`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when the status enters `completed` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a fresh `pending` operation.
    pub fn new(
        op_type: impl Into<String>,
        data: serde_json::Value,
        source: OperationSource,
    ) -> Self {
        Self {
            id: OperationId::new(),
            op_type: op_type.into(),
            data,
            status: OperationStatus::Pending,
            source,
            retry_count: 0,
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Claim: `pending → processing`, recording `started_at`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != OperationStatus::Pending {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: OperationStatus::Processing,
            });
        }
        self.status = OperationStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Finish: `processing → {completed, failed}`, recording `completed_at`.
    pub fn mark_terminal(
        &mut self,
        outcome: TerminalOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != OperationStatus::Processing {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: outcome.status(),
            });
        }
        match outcome {
            TerminalOutcome::Completed { result } => {
                self.status = OperationStatus::Completed;
                self.result = Some(result);
                self.error = None;
            }
            TerminalOutcome::Failed { error } => {
                self.status = OperationStatus::Failed;
                self.error = Some(error);
            }
        }
        self.completed_at = Some(now);
        Ok(())
    }

    /// Give the operation another chance: `processing → pending`.
    ///
    /// Increments `retry_count`, clears both progress timestamps and records
    /// `note` in `error` so the stall reason survives until the next attempt.
    pub fn reset_for_retry(
        &mut self,
        note: impl Into<String>,
        _now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != OperationStatus::Processing {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: OperationStatus::Pending,
            });
        }
        self.status = OperationStatus::Pending;
        self.retry_count += 1;
        self.error = Some(note.into());
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Wall-clock runtime of a finished operation.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}
