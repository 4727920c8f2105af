//! clustercron -- cron-style task scheduling for a cluster of nodes.
//!
//! Tasks are registered in-process with a schedule expression and an async
//! handler. Tasks marked global run on at most one node per fire, coordinated
//! through a lease row in a shared SQLite database; every execution is
//! recorded in the same database.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

pub use crate::config::ClusterCronConfig;
pub use crate::error::SchedulerError;
pub use crate::scheduler::{
    from_fn, RunOutcome, Scheduler, SchedulerOptions, TaskHandler, TaskSpec, TaskStatus,
};

/// Open the configured database, ensuring its directory exists.
pub fn open_configured_pool(config: &ClusterCronConfig) -> Result<storage::Pool> {
    let path = &config.storage.database_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory: {}", parent.display()))?;
    }
    let pool = storage::open_pool(&path.to_string_lossy())
        .with_context(|| format!("failed to open database: {}", path.display()))?;
    Ok(pool)
}

/// Build a scheduler from configuration, with the retention task registered
/// when enabled. The caller registers its own tasks and calls `start`.
pub fn build_scheduler(config: &ClusterCronConfig) -> Result<Scheduler> {
    let pool = open_configured_pool(config)?;
    let scheduler = Scheduler::new(pool, config.scheduler_options()?);
    if config.retention.enabled {
        scheduler
            .register_retention_task(&config.retention.schedule, config.retention.days)
            .context("invalid retention schedule")?;
    }
    Ok(scheduler)
}

/// Run the scheduler daemon until SIGINT or SIGTERM, then drain.
pub async fn serve(config: &ClusterCronConfig) -> Result<()> {
    info!(db_path = %config.storage.database_path.display(), "initializing database");
    let scheduler = build_scheduler(config)?;
    info!(node = %scheduler.node_id(), "starting clustercron daemon");
    scheduler.start()?;

    wait_for_shutdown_signal().await;

    scheduler.stop().await;
    Ok(())
}

/// Whether `path` looks like an existing database file.
pub fn database_exists(path: &Path) -> bool {
    path.is_file()
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
