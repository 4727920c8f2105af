//! Per-fire execution.
//!
//! `Idle -> enabled? -> [global? acquire lease] -> Running -> Success | Error
//!  -> release lease -> record history -> Idle`
//!
//! Nothing here returns an error to the driver: skips are reported as
//! [`RunOutcome::Skipped`] and handler failures end up in history.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::history::{ExecutionRecord, ExecutionStatus, FireKind, HistoryStore, NewExecution};
use super::lock::{LeaseGuard, LeaseLock};
use super::registry::{BeginRun, RunTicket, TaskRegistry};

/// Why a fire did not run on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnknownTask,
    Disabled,
    AlreadyRunning,
    /// Another node holds the lease. The normal multi-node steady state.
    LeaseHeld,
    /// The lock store could not be reached; fail closed.
    StoreUnavailable,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        status: ExecutionStatus,
        error: Option<String>,
        /// `None` if the history write failed.
        record: Option<ExecutionRecord>,
    },
    Skipped(SkipReason),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RunOutcome::Completed {
                status: ExecutionStatus::Success,
                ..
            }
        )
    }

    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            RunOutcome::Completed { record, .. } => record.as_ref(),
            RunOutcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            RunOutcome::Skipped(reason) => Some(*reason),
            RunOutcome::Completed { .. } => None,
        }
    }
}

/// Runs one fire of one task.
#[derive(Clone)]
pub struct Executor {
    registry: TaskRegistry,
    lock: Arc<dyn LeaseLock>,
    history: HistoryStore,
    node_id: String,
    lease_window: Duration,
}

impl Executor {
    pub fn new(
        registry: TaskRegistry,
        lock: Arc<dyn LeaseLock>,
        history: HistoryStore,
        node_id: impl Into<String>,
        lease_window: Duration,
    ) -> Self {
        Self {
            registry,
            lock,
            history,
            node_id: node_id.into(),
            lease_window,
        }
    }

    pub async fn execute(&self, name: &str, fired_by: FireKind) -> RunOutcome {
        let (ticket, mut slot) = match self.registry.begin_run(name) {
            BeginRun::Ready(ticket, slot) => (ticket, slot),
            BeginRun::Disabled => {
                debug!(task = %name, "task disabled, skipping fire");
                return RunOutcome::Skipped(SkipReason::Disabled);
            }
            BeginRun::AlreadyRunning => {
                debug!(task = %name, "previous run still in progress, skipping fire");
                return RunOutcome::Skipped(SkipReason::AlreadyRunning);
            }
            BeginRun::Unknown => {
                warn!(task = %name, "fire for unknown task");
                return RunOutcome::Skipped(SkipReason::UnknownTask);
            }
        };

        let lease = if ticket.global {
            match self
                .lock
                .acquire(name, &self.node_id, Utc::now(), self.lease_window)
                .await
            {
                Ok(true) => Some(LeaseGuard::new(self.lock.clone(), name, &self.node_id)),
                Ok(false) => {
                    debug!(task = %name, node = %self.node_id, "lease held by another node");
                    return RunOutcome::Skipped(SkipReason::LeaseHeld);
                }
                Err(e) => {
                    warn!(task = %name, node = %self.node_id, error = %e, "lock store unavailable, skipping fire");
                    return RunOutcome::Skipped(SkipReason::StoreUnavailable);
                }
            }
        } else {
            None
        };

        // The flag may have flipped while we were talking to the store.
        if !self.registry.is_enabled(name) {
            if let Some(guard) = lease {
                guard.release().await;
            }
            debug!(task = %name, "task disabled before start, skipping fire");
            return RunOutcome::Skipped(SkipReason::Disabled);
        }

        let started_at = Utc::now();
        slot.mark_ran(started_at);
        info!(task = %name, node = %self.node_id, %fired_by, "task started");

        let result = self.invoke(&ticket, lease.as_ref()).await;
        let finished_at = Utc::now();

        if let Some(guard) = lease {
            guard.release().await;
        }

        let (status, error) = match result {
            Ok(()) => {
                info!(
                    task = %name,
                    duration_ms = (finished_at - started_at).num_milliseconds(),
                    "task succeeded"
                );
                (ExecutionStatus::Success, None)
            }
            Err(msg) => {
                warn!(task = %name, error = %msg, "task failed");
                (ExecutionStatus::Error, Some(msg))
            }
        };

        let record = match self
            .history
            .record(NewExecution {
                task_name: name.to_string(),
                node_id: self.node_id.clone(),
                fired_by,
                started_at,
                finished_at,
                status,
                error: error.clone(),
            })
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                error!(task = %name, error = %e, "failed to record execution history");
                None
            }
        };

        drop(slot);
        RunOutcome::Completed {
            status,
            error,
            record,
        }
    }

    /// Call the handler, converting errors, panics and timeouts into an error
    /// message. Keeps a held lease fresh while the handler runs.
    async fn invoke(
        &self,
        ticket: &RunTicket,
        lease: Option<&LeaseGuard>,
    ) -> std::result::Result<(), String> {
        let handler = ticket.handler.clone();
        // The only unwind boundary in the engine.
        let guarded = AssertUnwindSafe(async move { handler.run().await }).catch_unwind();

        let timeout = ticket.timeout;
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, guarded)
                    .await
                    .map_err(|_| format!("timed out after {:.3}s", limit.as_secs_f64())),
                None => Ok(guarded.await),
            }
        };
        tokio::pin!(bounded);

        let outcome = match lease {
            None => bounded.await,
            Some(guard) => {
                let every = (self.lease_window / 2)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1))
                    .max(std::time::Duration::from_millis(100));
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    tokio::select! {
                        res = &mut bounded => break res,
                        _ = ticker.tick() => {
                            guard.refresh(Utc::now(), self.lease_window).await;
                        }
                    }
                }
            }
        };

        match outcome {
            Err(timed_out) => Err(timed_out),
            Ok(Err(panic)) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SchedulerError};
    use crate::scheduler::lock::{LockRecord, SqliteLeaseLock, DEFAULT_LEASE_WINDOW_SECS};
    use crate::scheduler::task::{from_fn, TaskSpec};
    use crate::storage::{open_memory_pool, Pool};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Fixture {
        pool: Pool,
        registry: TaskRegistry,
        executor: Executor,
        history: HistoryStore,
        lock: SqliteLeaseLock,
    }

    fn fixture(node: &str) -> Fixture {
        let pool = open_memory_pool().unwrap();
        fixture_on(pool, node)
    }

    fn fixture_on(pool: Pool, node: &str) -> Fixture {
        let registry = TaskRegistry::new();
        let history = HistoryStore::new(pool.clone());
        let lock = SqliteLeaseLock::new(pool.clone());
        let executor = Executor::new(
            registry.clone(),
            Arc::new(lock.clone()),
            history.clone(),
            node,
            Duration::seconds(DEFAULT_LEASE_WINDOW_SECS),
        );
        Fixture {
            pool,
            registry,
            executor,
            history,
            lock,
        }
    }

    #[tokio::test]
    async fn test_success_records_one_success() {
        let fx = fixture("n1");
        fx.registry
            .register(TaskSpec::new("cleanup", "@hourly", from_fn(|| async { Ok(()) })), Utc::now())
            .unwrap();

        let outcome = fx.executor.execute("cleanup", FireKind::Scheduled).await;
        assert!(outcome.is_success());

        let rows = fx.history.history("cleanup", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExecutionStatus::Success);
        assert_eq!(rows[0].node_id, "n1");
        assert!(rows[0].duration_ms >= 0);
        assert!(fx.registry.get("cleanup").unwrap().last_run.is_some());
    }

    #[tokio::test]
    async fn test_handler_error_is_recorded_with_detail() {
        let fx = fixture("n1");
        fx.registry
            .register(
                TaskSpec::new(
                    "backup",
                    "@daily",
                    from_fn(|| async {
                        Err::<(), _>(anyhow::anyhow!("bucket missing").context("upload failed"))
                    }),
                ),
                Utc::now(),
            )
            .unwrap();

        let outcome = fx.executor.execute("backup", FireKind::Manual).await;
        assert!(!outcome.is_success());

        let rows = fx.history.history("backup", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExecutionStatus::Error);
        assert_eq!(rows[0].fired_by, FireKind::Manual);
        assert_eq!(rows[0].error.as_deref(), Some("upload failed: bucket missing"));
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_lease_released() {
        let fx = fixture("n1");
        fx.registry
            .register(
                TaskSpec::new(
                    "flaky",
                    "@hourly",
                    from_fn(|| async {
                        if true {
                            panic!("index out of bounds");
                        }
                        Ok(())
                    }),
                )
                .global(true),
                Utc::now(),
            )
            .unwrap();

        let outcome = fx.executor.execute("flaky", FireKind::Scheduled).await;
        match outcome {
            RunOutcome::Completed { status, error, .. } => {
                assert_eq!(status, ExecutionStatus::Error);
                assert_eq!(error.as_deref(), Some("handler panicked: index out of bounds"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let rec = fx.lock.get("flaky").await.unwrap().unwrap();
        assert_eq!(rec.holder, None);
        assert!(!fx.registry.get("flaky").unwrap().running);
    }

    #[tokio::test]
    async fn test_timeout_marks_error_and_releases_lease() {
        let fx = fixture("n1");
        fx.registry
            .register(
                TaskSpec::new(
                    "slow",
                    "@hourly",
                    from_fn(|| async {
                        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                        Ok(())
                    }),
                )
                .global(true)
                .timeout(std::time::Duration::from_millis(50)),
                Utc::now(),
            )
            .unwrap();

        let outcome = fx.executor.execute("slow", FireKind::Scheduled).await;
        let record = outcome.record().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error.as_deref().unwrap().starts_with("timed out"));
        assert_eq!(fx.lock.get("slow").await.unwrap().unwrap().holder, None);
    }

    #[tokio::test]
    async fn test_disabled_task_is_skipped_without_history() {
        let fx = fixture("n1");
        fx.registry
            .register(TaskSpec::new("cleanup", "@hourly", from_fn(|| async { Ok(()) })), Utc::now())
            .unwrap();
        fx.registry.set_enabled("cleanup", false).unwrap();

        let outcome = fx.executor.execute("cleanup", FireKind::Scheduled).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Disabled));
        assert!(fx.history.last_run("cleanup").await.unwrap().is_none());
        assert!(fx.registry.get("cleanup").unwrap().last_run.is_none());
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_skips_without_history() {
        let fx = fixture("n1");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fx.registry
            .register(
                TaskSpec::new(
                    "backup-daily",
                    "@daily",
                    from_fn(move || {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .global(true),
                Utc::now(),
            )
            .unwrap();

        let window = Duration::seconds(DEFAULT_LEASE_WINDOW_SECS);
        assert!(fx.lock.acquire("backup-daily", "n2", Utc::now(), window).await.unwrap());

        let outcome = fx.executor.execute("backup-daily", FireKind::Scheduled).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::LeaseHeld));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fx.history.last_run("backup-daily").await.unwrap().is_none());

        // n2's lease is untouched.
        let rec = fx.lock.get("backup-daily").await.unwrap().unwrap();
        assert_eq!(rec.holder.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn test_local_tasks_never_touch_lock_table() {
        let fx = fixture("n1");
        fx.registry
            .register(TaskSpec::new("local", "@hourly", from_fn(|| async { Ok(()) })), Utc::now())
            .unwrap();
        fx.executor.execute("local", FireKind::Scheduled).await;

        let count: i64 = fx
            .pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM task_locks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    struct UnreachableLock;

    #[async_trait::async_trait]
    impl LeaseLock for UnreachableLock {
        async fn acquire(&self, _: &str, _: &str, _: DateTime<Utc>, _: Duration) -> Result<bool> {
            Err(SchedulerError::StoreUnavailable("connection refused".into()))
        }
        async fn release(&self, _: &str, _: &str) -> Result<bool> {
            Err(SchedulerError::StoreUnavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<LockRecord>> {
            Ok(None)
        }
        async fn set_enabled(&self, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        async fn list(&self) -> Result<Vec<LockRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_unreachable_lock_store_fails_closed() {
        let pool = open_memory_pool().unwrap();
        let registry = TaskRegistry::new();
        let history = HistoryStore::new(pool);
        let executor = Executor::new(
            registry.clone(),
            Arc::new(UnreachableLock),
            history.clone(),
            "n1",
            Duration::seconds(DEFAULT_LEASE_WINDOW_SECS),
        );
        registry
            .register(
                TaskSpec::new("global", "@hourly", from_fn(|| async { Ok(()) })).global(true),
                Utc::now(),
            )
            .unwrap();

        let outcome = executor.execute("global", FireKind::Scheduled).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::StoreUnavailable));
        assert!(history.last_run("global").await.unwrap().is_none());
        assert!(!registry.get("global").unwrap().running);
    }

    #[tokio::test]
    async fn test_same_task_does_not_overlap_and_disable_does_not_interrupt() {
        let fx = fixture("n1");
        let started = Arc::new(Notify::new());
        let finish = Arc::new(Notify::new());
        let (s, f) = (started.clone(), finish.clone());
        fx.registry
            .register(
                TaskSpec::new(
                    "report",
                    "@hourly",
                    from_fn(move || {
                        let (s, f) = (s.clone(), f.clone());
                        async move {
                            s.notify_one();
                            f.notified().await;
                            Ok(())
                        }
                    }),
                ),
                Utc::now(),
            )
            .unwrap();

        let executor = fx.executor.clone();
        let first = tokio::spawn(async move { executor.execute("report", FireKind::Scheduled).await });
        started.notified().await;

        let second = fx.executor.execute("report", FireKind::Manual).await;
        assert_eq!(second.skip_reason(), Some(SkipReason::AlreadyRunning));

        fx.registry.set_enabled("report", false).unwrap();
        finish.notify_one();

        let first = first.await.unwrap();
        assert!(first.is_success());
        assert_eq!(fx.history.history("report", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_nodes_share_one_lease() {
        let pool = open_memory_pool().unwrap();
        let a = fixture_on(pool.clone(), "n1");
        let b = fixture_on(pool, "n2");
        for fx in [&a, &b] {
            fx.registry
                .register(
                    TaskSpec::new("backup-daily", "@daily", from_fn(|| async { Ok(()) })).global(true),
                    Utc::now(),
                )
                .unwrap();
        }

        // Sequential runs: each releases, so both succeed.
        assert!(a.executor.execute("backup-daily", FireKind::Scheduled).await.is_success());
        assert!(b.executor.execute("backup-daily", FireKind::Scheduled).await.is_success());

        let nodes: Vec<String> = a
            .history
            .history("backup-daily", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.node_id)
            .collect();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.contains(&"n1".to_string()) && nodes.contains(&"n2".to_string()));
    }
}
