//! The polling dispatcher: turns `pending`, `source=api` operations into
//! executed handlers, in creation order.
//!
//! One poll cycle lists the pending backlog, claims each row with the store's
//! atomic compare-and-set, and runs the mapped handler to completion. With
//! `max_concurrent = 1` (the default) execution is fully serialized; larger
//! values fan claimed operations out onto a bounded set of tasks, with
//! per-operation exclusivity still guaranteed by the claim.
//!
//! A handler that never exits leaves its row in `processing`; recovering that
//! is the watchdog's job, not the dispatcher's.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use hostpilot_core::{Operation, OperationSource, RetryPolicy, TerminalOutcome};

use crate::handler::{self, HandlerFailure};
use crate::registry::HandlerRegistry;
use crate::store::{OperationStore, OperationStoreError};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll for new work.
    pub poll_interval: Duration,
    /// Maximum operations executed at once. 1 = fully serialized.
    pub max_concurrent: usize,
    /// Bound on resets after handler failures.
    pub retry: RetryPolicy,
    /// Name for logging.
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent: 1,
            retry: RetryPolicy::default(),
            name: "dispatcher".to_string(),
        }
    }
}

/// Handle to a spawned dispatcher loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the loop to finish its cycle.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

/// Polls the store and executes claimed operations through the registry.
pub struct Dispatcher {
    store: Arc<dyn OperationStore>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OperationStore>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Spawn the polling loop on the current runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(dispatcher = %self.config.name, "dispatcher started");

            let mut poll = tokio::time::interval(self.config.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.notified() => {
                        info!(dispatcher = %self.config.name, "dispatcher received shutdown signal");
                        break;
                    }
                    _ = poll.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(dispatcher = %self.config.name, error = %e, "dispatch cycle failed");
                        }
                    }
                }
            }

            info!(dispatcher = %self.config.name, "dispatcher stopped");
        });

        DispatcherHandle { shutdown, join }
    }

    /// One poll cycle: claim and execute every currently-pending api
    /// operation. Returns the number of operations executed.
    pub async fn run_once(&self) -> Result<usize, OperationStoreError> {
        let pending = self.store.list_pending(OperationSource::Api).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(
            dispatcher = %self.config.name,
            backlog = pending.len(),
            "claiming pending operations"
        );

        if self.config.max_concurrent <= 1 {
            let mut executed = 0;
            for op in pending {
                if !self.store.claim(op.id).await? {
                    continue;
                }
                dispatch_operation(
                    self.store.clone(),
                    self.registry.clone(),
                    self.config.retry,
                    op,
                )
                .await;
                executed += 1;
            }
            return Ok(executed);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks = JoinSet::new();
        let mut executed = 0;

        for op in pending {
            if !self.store.claim(op.id).await? {
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let registry = self.registry.clone();
            let retry = self.config.retry;
            tasks.spawn(async move {
                let _permit = permit;
                dispatch_operation(store, registry, retry, op).await;
            });
            executed += 1;
        }
        while tasks.join_next().await.is_some() {}

        Ok(executed)
    }
}

/// Execute one claimed operation and record its outcome.
///
/// Outcome recording is best-effort deliberate: if the store rejects the
/// write (e.g. the watchdog already reset the row), the row's state is
/// already owned by someone else and we only log.
async fn dispatch_operation(
    store: Arc<dyn OperationStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    op: Operation,
) {
    let outcome = match registry.lookup(&op.op_type) {
        None => Err(HandlerFailure::NoHandler),
        Some(command) => handler::invoke(command, &op.op_type, op.id).await,
    };

    let write = match outcome {
        Ok(result) => {
            info!(operation = %op.id, op_type = %op.op_type, "operation completed");
            store
                .set_terminal(op.id, TerminalOutcome::completed(result))
                .await
        }
        Err(HandlerFailure::NoHandler) => {
            warn!(operation = %op.id, op_type = %op.op_type, "no handler configured");
            store
                .set_terminal(op.id, TerminalOutcome::failed("no handler configured"))
                .await
        }
        Err(HandlerFailure::Unavailable(detail)) => {
            warn!(
                operation = %op.id,
                op_type = %op.op_type,
                detail = %detail,
                "handler unavailable"
            );
            store
                .set_terminal(op.id, TerminalOutcome::failed("handler unavailable"))
                .await
        }
        Err(failure) => {
            // This execution is attempt retry_count + 1. Give the operation
            // back to the queue while attempts remain; the final attempt
            // fails permanently.
            let attempt = op.retry_count + 1;
            if attempt < retry.max_retries {
                warn!(
                    operation = %op.id,
                    op_type = %op.op_type,
                    attempt,
                    error = %failure,
                    "handler failed, queueing retry"
                );
                store.reset_for_retry(op.id, &failure.retry_note()).await
            } else {
                warn!(
                    operation = %op.id,
                    op_type = %op.op_type,
                    attempt,
                    error = %failure,
                    "handler failed permanently"
                );
                store
                    .set_terminal(
                        op.id,
                        TerminalOutcome::failed(format!(
                            "Operation failed after {} retries",
                            retry.max_retries
                        )),
                    )
                    .await
            }
        }
    };

    if let Err(e) = write {
        error!(operation = %op.id, error = %e, "failed to record operation outcome");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use hostpilot_core::OperationStatus;

    use crate::store::InMemoryOperationStore;

    use super::*;

    fn dispatcher(
        store: Arc<InMemoryOperationStore>,
        registry: HandlerRegistry,
        max_retries: u32,
    ) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(registry),
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                retry: RetryPolicy::new(max_retries),
                ..DispatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn unknown_type_fails_terminally() {
        let store = InMemoryOperationStore::arc();
        let d = dispatcher(store.clone(), HandlerRegistry::default(), 3);

        let op = store
            .enqueue("site.create", json!({}), OperationSource::Api)
            .await
            .unwrap();
        assert_eq!(d.run_once().await.unwrap(), 1);

        let failed = store.get(op.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("no handler configured"));
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn missing_executable_fails_terminally() {
        let store = InMemoryOperationStore::arc();
        let registry = HandlerRegistry::from_entries([(
            "site.create",
            crate::registry::HandlerCommand::new("/nonexistent/handler.sh"),
        )]);
        let d = dispatcher(store.clone(), registry, 3);

        let op = store
            .enqueue("site.create", json!({}), OperationSource::Api)
            .await
            .unwrap();
        d.run_once().await.unwrap();

        let failed = store.get(op.id).await.unwrap().unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("handler unavailable"));
    }

    #[tokio::test]
    async fn ui_rows_are_never_claimed() {
        let store = InMemoryOperationStore::arc();
        let d = dispatcher(store.clone(), HandlerRegistry::default(), 3);

        let op = store
            .enqueue("site.create", json!({}), OperationSource::Ui)
            .await
            .unwrap();
        assert_eq!(d.run_once().await.unwrap(), 0);

        let untouched = store.get(op.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn empty_backlog_is_a_no_op() {
        let store = InMemoryOperationStore::arc();
        let d = dispatcher(store.clone(), HandlerRegistry::default(), 3);
        assert_eq!(d.run_once().await.unwrap(), 0);
    }

    #[cfg(unix)]
    mod with_scripts {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        use crate::registry::HandlerCommand;

        use super::*;

        fn write_script(dir: &Path, name: &str, body: &str) -> HandlerCommand {
            let path = dir.join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            HandlerCommand::new(path)
        }

        #[tokio::test]
        async fn successful_dispatch_completes_with_result() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(dir.path(), "ok.sh", r#"echo "{\"site_id\": 42}""#);
            let store = InMemoryOperationStore::arc();
            let d = dispatcher(
                store.clone(),
                HandlerRegistry::from_entries([("site.create", cmd)]),
                3,
            );

            let op = store
                .enqueue(
                    "site.create",
                    json!({"domain_name": "example.com", "type": "php", "php_version": "8.2"}),
                    OperationSource::Api,
                )
                .await
                .unwrap();
            assert_eq!(d.run_once().await.unwrap(), 1);

            let done = store.get(op.id).await.unwrap().unwrap();
            assert_eq!(done.status, OperationStatus::Completed);
            assert_eq!(done.result, Some(json!({"site_id": 42})));
            assert!(done.started_at.is_some());
            assert!(done.completed_at.is_some());
        }

        #[tokio::test]
        async fn nonzero_exit_retries_then_fails_permanently() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(dir.path(), "fail.sh", "echo \"quota exceeded\" >&2\nexit 1");
            let store = InMemoryOperationStore::arc();
            let d = dispatcher(
                store.clone(),
                HandlerRegistry::from_entries([("site.create", cmd)]),
                3,
            );

            let op = store
                .enqueue("site.create", json!({}), OperationSource::Api)
                .await
                .unwrap();

            // First two failures queue a retry with the captured output.
            d.run_once().await.unwrap();
            let after_first = store.get(op.id).await.unwrap().unwrap();
            assert_eq!(after_first.status, OperationStatus::Pending);
            assert_eq!(after_first.retry_count, 1);
            assert!(after_first.error.as_deref().unwrap().contains("quota exceeded"));

            d.run_once().await.unwrap();
            let after_second = store.get(op.id).await.unwrap().unwrap();
            assert_eq!(after_second.status, OperationStatus::Pending);
            assert_eq!(after_second.retry_count, 2);

            // Third consecutive failure is permanent.
            d.run_once().await.unwrap();
            let failed = store.get(op.id).await.unwrap().unwrap();
            assert_eq!(failed.status, OperationStatus::Failed);
            assert_eq!(
                failed.error.as_deref(),
                Some("Operation failed after 3 retries")
            );

            // Never reclaimed afterwards.
            assert_eq!(d.run_once().await.unwrap(), 0);
            let still_failed = store.get(op.id).await.unwrap().unwrap();
            assert_eq!(still_failed.status, OperationStatus::Failed);
        }

        #[tokio::test]
        async fn backlog_is_dispatched_in_creation_order() {
            let dir = tempfile::tempdir().unwrap();
            // Each run appends its operation id to a log file.
            let log = dir.path().join("order.log");
            let cmd = write_script(
                dir.path(),
                "log.sh",
                &format!("echo \"$2\" >> {}", log.display()),
            );
            let store = InMemoryOperationStore::arc();
            let d = dispatcher(
                store.clone(),
                HandlerRegistry::from_entries([("site.create", cmd)]),
                3,
            );

            let first = store
                .enqueue("site.create", json!({}), OperationSource::Api)
                .await
                .unwrap();
            let second = store
                .enqueue("site.create", json!({}), OperationSource::Api)
                .await
                .unwrap();

            assert_eq!(d.run_once().await.unwrap(), 2);

            let logged = std::fs::read_to_string(&log).unwrap();
            let ids: Vec<_> = logged.lines().collect();
            assert_eq!(ids, vec![first.id.to_string(), second.id.to_string()]);
        }

        #[tokio::test]
        async fn bounded_concurrency_executes_all_claims() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(dir.path(), "ok.sh", "echo done");
            let store = InMemoryOperationStore::arc();
            let d = Dispatcher::new(
                store.clone(),
                Arc::new(HandlerRegistry::from_entries([("site.create", cmd)])),
                DispatcherConfig {
                    max_concurrent: 4,
                    retry: RetryPolicy::default(),
                    ..DispatcherConfig::default()
                },
            );

            for _ in 0..8 {
                store
                    .enqueue("site.create", json!({}), OperationSource::Api)
                    .await
                    .unwrap();
            }
            assert_eq!(d.run_once().await.unwrap(), 8);

            let completed = store
                .list_by_status(OperationStatus::Completed, 16)
                .await
                .unwrap();
            assert_eq!(completed.len(), 8);
        }

        #[tokio::test]
        async fn spawned_loop_picks_up_work_within_a_poll_interval() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(dir.path(), "ok.sh", r#"echo "{\"ok\": true}""#);
            let store = InMemoryOperationStore::arc();
            let d = dispatcher(
                store.clone(),
                HandlerRegistry::from_entries([("site.create", cmd)]),
                3,
            );
            let handle = d.spawn();

            let op = store
                .enqueue("site.create", json!({}), OperationSource::Api)
                .await
                .unwrap();

            let mut status = OperationStatus::Pending;
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                status = store.get(op.id).await.unwrap().unwrap().status;
                if status.is_terminal() {
                    break;
                }
            }
            handle.shutdown().await;

            assert_eq!(status, OperationStatus::Completed);
        }
    }
}
