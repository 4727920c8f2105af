//! Execution history tracking for scheduled runs.
//!
//! `task_executions` is append-only: rows are inserted once per run that
//! actually invoked a handler and are only ever removed by retention pruning.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{params, types::Type, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::task::TaskHandler;
use crate::error::Result;
use crate::storage::{format_ts, opt_ts_column, ts_column, with_conn, Pool};

/// Default retention for execution records.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => f.pad("success"),
            ExecutionStatus::Error => f.pad("error"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireKind {
    Scheduled,
    Manual,
}

impl std::fmt::Display for FireKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FireKind::Scheduled => f.pad("scheduled"),
            FireKind::Manual => f.pad("manual"),
        }
    }
}

impl std::str::FromStr for FireKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(FireKind::Scheduled),
            "manual" => Ok(FireKind::Manual),
            other => Err(format!("unknown fire kind: {other}")),
        }
    }
}

/// An execution about to be appended.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_name: String,
    pub node_id: String,
    pub fired_by: FireKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// A stored execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_name: String,
    pub node_id: String,
    pub fired_by: FireKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// Aggregates over one task's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub task_name: String,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub avg_duration_ms: Option<f64>,
    pub last_started_at: Option<DateTime<Utc>>,
}

const RECORD_COLUMNS: &str = "id, task_name, node_id, fired_by, started_at, finished_at, \
                              duration_ms, status, error";

fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        task_name: row.get(1)?,
        node_id: row.get(2)?,
        fired_by: parse_column(row, 3)?,
        started_at: ts_column(row, 4)?,
        finished_at: ts_column(row, 5)?,
        duration_ms: row.get(6)?,
        status: parse_column(row, 7)?,
        error: row.get(8)?,
    })
}

/// Durable, queryable log of task executions.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append one execution and return it with its assigned id.
    pub async fn record(&self, mut exec: NewExecution) -> Result<ExecutionRecord> {
        // Stored precision is milliseconds; return exactly what a read would.
        exec.started_at = exec.started_at.trunc_subsecs(3);
        exec.finished_at = exec.finished_at.trunc_subsecs(3);
        let duration_ms = (exec.finished_at - exec.started_at).num_milliseconds().max(0);
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO task_executions
                 (task_name, node_id, fired_by, started_at, finished_at, duration_ms, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    exec.task_name,
                    exec.node_id,
                    exec.fired_by.to_string(),
                    format_ts(exec.started_at),
                    format_ts(exec.finished_at),
                    duration_ms,
                    exec.status.to_string(),
                    exec.error,
                ],
            )?;
            Ok(ExecutionRecord {
                id: conn.last_insert_rowid(),
                task_name: exec.task_name,
                node_id: exec.node_id,
                fired_by: exec.fired_by,
                started_at: exec.started_at,
                finished_at: exec.finished_at,
                duration_ms,
                status: exec.status,
                error: exec.error,
            })
        })
        .await
    }

    /// Most recent execution of `task`, if any.
    pub async fn last_run(&self, task: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.history(task, 1).await?.into_iter().next())
    }

    /// Up to `limit` most recent executions, newest first.
    pub async fn history(&self, task: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let task = task.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM task_executions
                 WHERE task_name = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![task, limit], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn stats(&self, task: &str) -> Result<TaskStats> {
        let task = task.to_string();
        with_conn(&self.pool, move |conn| {
            let stats = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'success'), 0),
                            COALESCE(SUM(status = 'error'), 0),
                            AVG(duration_ms),
                            MAX(started_at)
                     FROM task_executions WHERE task_name = ?1",
                    params![task],
                    |row| {
                        Ok(TaskStats {
                            task_name: task.clone(),
                            total: row.get::<_, i64>(0)? as u64,
                            success: row.get::<_, i64>(1)? as u64,
                            error: row.get::<_, i64>(2)? as u64,
                            avg_duration_ms: row.get(3)?,
                            last_started_at: opt_ts_column(row, 4)?,
                        })
                    },
                )
                .optional()?;
            Ok(stats.unwrap_or_else(|| TaskStats {
                task_name: task,
                ..TaskStats::default()
            }))
        })
        .await
    }

    /// Delete records that started more than `days` days ago.
    pub async fn prune_older_than(&self, days: u32) -> Result<usize> {
        self.prune_before(Utc::now() - Duration::days(i64::from(days)))
            .await
    }

    /// Delete records that started before `cutoff`.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(cutoff);
        with_conn(&self.pool, move |conn| {
            let deleted = conn.execute(
                "DELETE FROM task_executions WHERE started_at < ?1",
                params![cutoff],
            )?;
            Ok(deleted)
        })
        .await
    }
}

/// Retention job: prunes history older than a fixed number of days.
///
/// Meant to be registered as an ordinary, non-global task on every node; the
/// delete is idempotent so concurrent pruning is harmless.
pub struct HistoryPruneTask {
    history: HistoryStore,
    retention_days: u32,
}

impl HistoryPruneTask {
    pub fn new(history: HistoryStore, retention_days: u32) -> Self {
        Self {
            history,
            retention_days,
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for HistoryPruneTask {
    async fn run(&self) -> anyhow::Result<()> {
        let deleted = self.history.prune_older_than(self.retention_days).await?;
        info!(deleted, retention_days = self.retention_days, "pruned execution history");
        Ok(())
    }
}
