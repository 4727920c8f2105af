//! Cluster-aware task scheduler.
//!
//! [`Scheduler`] is the public surface: register tasks, start the driver, stop
//! it with a graceful drain, toggle and force-run tasks, and query status and
//! history. Everything it owns is per-instance, so several independent
//! schedulers (e.g. simulated nodes in a test) can share one process.

pub mod engine;
pub mod history;
pub mod lock;
pub mod registry;
pub mod task;
pub mod trigger;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::storage::Pool;

pub use self::engine::{Executor, RunOutcome, SkipReason};
pub use self::history::{
    ExecutionRecord, ExecutionStatus, FireKind, HistoryPruneTask, HistoryStore, NewExecution,
    TaskStats, DEFAULT_RETENTION_DAYS,
};
pub use self::lock::{LeaseLock, LockRecord, SqliteLeaseLock, DEFAULT_LEASE_WINDOW_SECS};
pub use self::registry::{TaskRegistry, TaskSnapshot};
pub use self::task::{from_fn, FnHandler, TaskHandler, TaskSpec};
pub use self::trigger::Trigger;

/// Name under which [`Scheduler::register_retention_task`] registers pruning.
pub const RETENTION_TASK_NAME: &str = "history-retention";

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Identity of this process within the cluster.
    pub node_id: String,
    pub lease_window: Duration,
    /// How often the driver checks for due tasks.
    pub tick_interval: StdDuration,
}

impl SchedulerOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            lease_window: Duration::seconds(DEFAULT_LEASE_WINDOW_SECS),
            tick_interval: StdDuration::from_secs(1),
        }
    }

    pub fn lease_window(mut self, lease_window: Duration) -> Self {
        self.lease_window = lease_window;
        self
    }

    pub fn tick_interval(mut self, tick_interval: StdDuration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
}

/// Status row for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub global: bool,
    pub running: bool,
    pub next_fire: Option<DateTime<Utc>>,
    /// Most recent execution recorded by any node.
    pub last_run: Option<ExecutionRecord>,
    /// Most recent start of a run on this node.
    pub last_local_run: Option<DateTime<Utc>>,
    /// Node currently holding an unexpired lease, for global tasks.
    pub lease_holder: Option<String>,
}

struct Inner {
    registry: TaskRegistry,
    history: HistoryStore,
    lock: Arc<dyn LeaseLock>,
    executor: Executor,
    options: SchedulerOptions,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// A scheduler whose lease lock lives in the same SQLite database.
    pub fn new(pool: Pool, options: SchedulerOptions) -> Self {
        let lock = Arc::new(SqliteLeaseLock::new(pool.clone()));
        Self::with_lock(pool, lock, options)
    }

    /// A scheduler using a custom [`LeaseLock`] implementation.
    pub fn with_lock(pool: Pool, lock: Arc<dyn LeaseLock>, options: SchedulerOptions) -> Self {
        let registry = TaskRegistry::new();
        let history = HistoryStore::new(pool);
        let executor = Executor::new(
            registry.clone(),
            lock.clone(),
            history.clone(),
            options.node_id.clone(),
            options.lease_window,
        );
        Self {
            inner: Arc::new(Inner {
                registry,
                history,
                lock,
                executor,
                options,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.options.node_id
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.inner.history
    }

    /// Register a task with default options.
    pub fn register(
        &self,
        name: &str,
        schedule: &str,
        handler: impl TaskHandler + 'static,
        global: bool,
    ) -> Result<()> {
        self.register_task(TaskSpec::new(name, schedule, handler).global(global))
    }

    pub fn register_task(&self, spec: TaskSpec) -> Result<()> {
        let name = spec.name.clone();
        let schedule = spec.schedule.clone();
        let global = spec.global;
        self.inner.registry.register(spec, Utc::now())?;
        info!(task = %name, %schedule, global, "task registered");
        Ok(())
    }

    /// Register history pruning as a local task on `schedule`.
    pub fn register_retention_task(&self, schedule: &str, retention_days: u32) -> Result<()> {
        let handler = HistoryPruneTask::new(self.inner.history.clone(), retention_days);
        self.register(RETENTION_TASK_NAME, schedule, handler, false)
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.inner.registry.set_enabled(name, true)?;
        info!(task = %name, "task enabled");
        Ok(())
    }

    /// Prevent future fires. A run already in progress is not interrupted.
    pub fn disable(&self, name: &str) -> Result<()> {
        self.inner.registry.set_enabled(name, false)?;
        info!(task = %name, "task disabled");
        Ok(())
    }

    /// Fire `name` now, outside its schedule, in the background.
    ///
    /// Global tasks still compete for the lease. Must be called from within a
    /// Tokio runtime.
    pub fn trigger_now(&self, name: &str) -> Result<JoinHandle<RunOutcome>> {
        self.check_manual(name)?;
        let executor = self.inner.executor.clone();
        let name = name.to_string();
        info!(task = %name, "manual trigger");
        Ok(self
            .inner
            .tracker
            .spawn(async move { executor.execute(&name, FireKind::Manual).await }))
    }

    /// Fire `name` now and wait for the outcome.
    pub async fn run_now(&self, name: &str) -> Result<RunOutcome> {
        self.check_manual(name)?;
        let executor = self.inner.executor.clone();
        let task = name.to_string();
        let handle = self
            .inner
            .tracker
            .spawn(async move { executor.execute(&task, FireKind::Manual).await });
        handle.await.map_err(|e| SchedulerError::RunAborted {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn check_manual(&self, name: &str) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        if !self.inner.registry.contains(name) {
            return Err(SchedulerError::UnknownTask {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Spawn the driver loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let registry = self.inner.registry.clone();
        let executor = self.inner.executor.clone();
        let tracker = self.inner.tracker.clone();
        let shutdown = self.inner.shutdown.clone();
        let tick = self.inner.options.tick_interval;
        *driver = Some(tokio::spawn(drive(registry, executor, tracker, shutdown, tick)));

        info!(
            node = %self.inner.options.node_id,
            lease_secs = self.inner.options.lease_window.num_seconds(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop firing new runs and wait for in-flight executions to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler driver ended abnormally");
            }
        }

        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for running tasks to finish");
        }
        self.inner.tracker.wait().await;
        info!(node = %self.inner.options.node_id, "scheduler stopped");
    }

    /// Per-task status. Store failures degrade to registry-only data.
    pub async fn status(&self) -> Vec<TaskStatus> {
        let now = Utc::now();
        let mut out = Vec::new();
        for snap in self.inner.registry.snapshot() {
            let last_run = match self.inner.history.last_run(&snap.name).await {
                Ok(rec) => rec,
                Err(e) => {
                    warn!(task = %snap.name, error = %e, "history unavailable for status");
                    None
                }
            };
            let lease_holder = if snap.global {
                match self.inner.lock.get(&snap.name).await {
                    Ok(Some(rec)) if rec.is_held(now, self.inner.options.lease_window) => rec.holder,
                    Ok(_) => None,
                    Err(e) => {
                        warn!(task = %snap.name, error = %e, "lock store unavailable for status");
                        None
                    }
                }
            } else {
                None
            };
            out.push(TaskStatus {
                name: snap.name,
                schedule: snap.schedule,
                enabled: snap.enabled,
                global: snap.global,
                running: snap.running,
                next_fire: snap.next_fire,
                last_run,
                last_local_run: snap.last_run,
                lease_holder,
            });
        }
        out
    }

    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.inner.history.history(name, limit).await
    }

    pub async fn stats(&self, name: &str) -> Result<TaskStats> {
        self.inner.history.stats(name).await
    }

    pub async fn last_run(&self, name: &str) -> Result<Option<ExecutionRecord>> {
        self.inner.history.last_run(name).await
    }
}

/// Driver loop: every tick, dispatch due tasks without waiting on them.
async fn drive(
    registry: TaskRegistry,
    executor: Executor,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    tick: StdDuration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                for name in registry.take_due(Utc::now()) {
                    debug!(task = %name, "task due");
                    let executor = executor.clone();
                    tracker.spawn(async move {
                        executor.execute(&name, FireKind::Scheduled).await;
                    });
                }
            }
        }
    }
    debug!("scheduler driver exited");
}
