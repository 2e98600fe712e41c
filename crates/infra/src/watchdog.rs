//! The watchdog: stall recovery plus daily statistics and archival.
//!
//! Runs its own polling loop, independent of the dispatcher. Each cycle it
//! sweeps `processing`, `source=api` rows whose `started_at` is older than
//! the stall threshold and applies the bounded-retry decision: reset to
//! `pending` while the policy allows, fail permanently once retries are
//! exhausted. Once per day it logs aggregate statistics and moves old
//! terminal rows into the archive.
//!
//! Cycle entry points take `now` as a parameter so tests drive the clock
//! directly; the spawned loop feeds in wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use hostpilot_core::{RetryPolicy, TerminalOutcome};

use crate::store::{OperationStore, OperationStoreError};

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often to run a sweep cycle.
    pub interval: Duration,
    /// Age of `started_at` past which a `processing` row counts as stalled.
    pub stall_threshold: Duration,
    /// Bound on resets for stalled operations.
    pub retry: RetryPolicy,
    /// Terminal rows older than this are archived by the daily task.
    pub archive_retention_days: i64,
    /// Wall-clock time (UTC) at which the daily tasks become due.
    pub daily_at: NaiveTime,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
            archive_retention_days: 30,
            daily_at: NaiveTime::MIN,
        }
    }
}

/// Handle to a spawned watchdog loop.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl WatchdogHandle {
    /// Request graceful shutdown and wait for the loop to finish its cycle.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

/// Detects operations that stopped making progress and keeps the live table
/// bounded.
pub struct Watchdog {
    store: Arc<dyn OperationStore>,
    config: WatchdogConfig,
    last_daily_run: Option<NaiveDate>,
}

impl Watchdog {
    pub fn new(store: Arc<dyn OperationStore>, config: WatchdogConfig) -> Self {
        Self {
            store,
            config,
            last_daily_run: None,
        }
    }

    /// Spawn the polling loop on the current runtime.
    ///
    /// Store failures inside a cycle are logged and the loop carries on; a
    /// flaky store must never take the watchdog down with it.
    pub fn spawn(mut self) -> WatchdogHandle {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();

        let join = tokio::spawn(async move {
            info!("watchdog started");

            let mut cycle = tokio::time::interval(self.config.interval);
            cycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.notified() => {
                        info!("watchdog received shutdown signal");
                        break;
                    }
                    _ = cycle.tick() => {
                        let now = Utc::now();
                        if let Err(e) = self.sweep_once(now).await {
                            error!(error = %e, "watchdog sweep failed");
                        }
                        if let Err(e) = self.run_daily_if_due(now).await {
                            error!(error = %e, "watchdog daily tasks failed");
                        }
                    }
                }
            }

            info!("watchdog stopped");
        });

        WatchdogHandle { shutdown, join }
    }

    /// One stall sweep. Every stalled row is resolved within this call:
    /// reset for retry while the bound allows, failed permanently otherwise.
    /// Returns the number of rows resolved.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, OperationStoreError> {
        let threshold =
            chrono::Duration::from_std(self.config.stall_threshold).unwrap_or_default();
        let stalled = self.store.list_stalled(now - threshold).await?;
        if stalled.is_empty() {
            return Ok(0);
        }

        let mut resolved = 0;
        for op in stalled {
            if self.config.retry.should_retry(op.retry_count) {
                warn!(
                    operation = %op.id,
                    op_type = %op.op_type,
                    retry_count = op.retry_count,
                    "operation stalled, queueing retry"
                );
                self.store
                    .reset_for_retry(op.id, "stuck — retrying")
                    .await?;
            } else {
                warn!(
                    operation = %op.id,
                    op_type = %op.op_type,
                    retry_count = op.retry_count,
                    "operation stalled with retries exhausted"
                );
                self.store
                    .set_terminal(op.id, TerminalOutcome::failed("exceeded max retries"))
                    .await?;
            }
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Run the daily tasks if they are due: log aggregate statistics over the
    /// trailing 24 hours, then archive old terminal rows. Runs at most once
    /// per calendar day, on the first cycle at or after `daily_at`.
    /// Returns whether the tasks ran.
    pub async fn run_daily_if_due(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<bool, OperationStoreError> {
        let today = now.date_naive();
        if now.time() < self.config.daily_at || self.last_daily_run == Some(today) {
            return Ok(false);
        }

        let stats = self.store.stats(now - chrono::Duration::hours(24)).await?;
        info!(
            pending = stats.pending,
            processing = stats.processing,
            completed = stats.completed,
            failed = stats.failed,
            mean_completed_duration_ms = stats.mean_completed_duration_ms,
            "daily operation report"
        );

        let cutoff = now - chrono::Duration::days(self.config.archive_retention_days);
        let archived = self.store.archive_and_delete(cutoff).await?;
        if archived > 0 {
            info!(archived, "archived old terminal operations");
        } else {
            debug!("no terminal operations due for archival");
        }

        self.last_daily_run = Some(today);
        Ok(true)
    }
}
