//! Lease-based advisory lock for cluster-global tasks.
//!
//! Each global task owns one row in `task_locks`. A node holds the lease while
//! its `acquired_at` is younger than the lease window; after that any node may
//! take it over. There is no failure detector: a crashed holder's lease simply
//! ages out.
//!
//! Every write is a single guarded statement. Acquisition is an upsert whose
//! update only applies when the lease is free, expired, or already ours, and
//! the outcome is decided by re-reading the row afterwards.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::{format_ts, opt_ts_column, with_conn, Pool};

/// Default lease window.
pub const DEFAULT_LEASE_WINDOW_SECS: i64 = 300;

/// One row of `task_locks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub task_name: String,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl LockRecord {
    /// Whether some node holds an unexpired lease at `now`.
    pub fn is_held(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match (&self.holder, self.acquired_at) {
            (Some(_), Some(at)) => at >= now - lease,
            _ => false,
        }
    }
}

/// Mutual exclusion for global tasks.
///
/// The engine only relies on `acquire` / `release` and treats an `Err` from
/// `acquire` as "not acquired", so a stronger lock manager can be dropped in
/// behind this trait.
#[async_trait::async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to take or refresh the lease on `task` for `node`.
    ///
    /// `Ok(false)` is the normal outcome when another node holds the lease.
    async fn acquire(
        &self,
        task: &str,
        node: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool>;

    /// Give up the lease if `node` still holds it. Returns whether a row changed.
    async fn release(&self, task: &str, node: &str) -> Result<bool>;

    async fn get(&self, task: &str) -> Result<Option<LockRecord>>;

    /// Cluster-wide switch: no node can acquire a disabled lease.
    async fn set_enabled(&self, task: &str, enabled: bool) -> Result<()>;

    async fn list(&self) -> Result<Vec<LockRecord>>;
}

/// [`LeaseLock`] backed by the shared SQLite database.
#[derive(Clone)]
pub struct SqliteLeaseLock {
    pool: Pool,
}

impl SqliteLeaseLock {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn lock_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    Ok(LockRecord {
        task_name: row.get(0)?,
        holder: row.get(1)?,
        acquired_at: opt_ts_column(row, 2)?,
        enabled: row.get::<_, i64>(3)? != 0,
    })
}

#[async_trait::async_trait]
impl LeaseLock for SqliteLeaseLock {
    async fn acquire(
        &self,
        task: &str,
        node: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let task = task.to_string();
        let node = node.to_string();
        let now_str = format_ts(now);
        let expired_before = format_ts(now - lease);

        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO task_locks (task_name, holder, acquired_at, enabled)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(task_name) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at
                 WHERE task_locks.enabled = 1
                   AND (task_locks.holder IS NULL
                        OR task_locks.acquired_at IS NULL
                        OR task_locks.acquired_at < ?4
                        OR task_locks.holder = excluded.holder)",
                params![task, node, now_str, expired_before],
            )?;

            // Decide on what is stored, not on whether our write applied.
            let current: Option<(Option<String>, i64)> = conn
                .query_row(
                    "SELECT holder, enabled FROM task_locks WHERE task_name = ?1",
                    params![task],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let acquired = matches!(
                current,
                Some((Some(ref holder), enabled)) if *holder == node && enabled != 0
            );
            debug!(task = %task, node = %node, acquired, "lease acquisition attempt");
            Ok(acquired)
        })
        .await
    }

    async fn release(&self, task: &str, node: &str) -> Result<bool> {
        let task = task.to_string();
        let node = node.to_string();
        with_conn(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE task_locks SET holder = NULL, acquired_at = NULL
                 WHERE task_name = ?1 AND holder = ?2",
                params![task, node],
            )?;
            if changed == 0 {
                debug!(task = %task, node = %node, "release skipped: lease not held by this node");
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn get(&self, task: &str) -> Result<Option<LockRecord>> {
        let task = task.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT task_name, holder, acquired_at, enabled FROM task_locks
                     WHERE task_name = ?1",
                    params![task],
                    lock_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn set_enabled(&self, task: &str, enabled: bool) -> Result<()> {
        let task = task.to_string();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO task_locks (task_name, enabled) VALUES (?1, ?2)
                 ON CONFLICT(task_name) DO UPDATE SET enabled = excluded.enabled",
                params![task, enabled as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<LockRecord>> {
        with_conn(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_name, holder, acquired_at, enabled FROM task_locks
                 ORDER BY task_name",
            )?;
            let rows = stmt
                .query_map([], lock_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

/// Releases a held lease when dropped.
///
/// The engine calls [`LeaseGuard::release`] explicitly. If that point is never
/// reached (the run future was dropped mid-flight), `Drop` hands the release
/// to the runtime so the lease is not kept until it expires.
pub(crate) struct LeaseGuard {
    lock: Arc<dyn LeaseLock>,
    task: String,
    node: String,
    released: bool,
}

impl LeaseGuard {
    pub fn new(lock: Arc<dyn LeaseLock>, task: &str, node: &str) -> Self {
        Self {
            lock,
            task: task.to_string(),
            node: node.to_string(),
            released: false,
        }
    }

    /// Refresh the lease while the task is still running.
    pub async fn refresh(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.lock.acquire(&self.task, &self.node, now, lease).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(task = %self.task, node = %self.node, "lease lost while running");
                false
            }
            Err(e) => {
                warn!(task = %self.task, node = %self.node, error = %e, "lease refresh failed");
                false
            }
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.lock.release(&self.task, &self.node).await {
            warn!(task = %self.task, node = %self.node, error = %e, "failed to release lease");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let task = std::mem::take(&mut self.task);
        let node = std::mem::take(&mut self.node);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release(&task, &node).await {
                        warn!(task = %task, node = %node, error = %e, "deferred lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(task = %task, node = %node, "no runtime to release lease; it will expire");
            }
        }
    }
}
