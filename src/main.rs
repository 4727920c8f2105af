use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clustercron::config::{ClusterCronConfig, LoggingConfig};
use clustercron::scheduler::{HistoryStore, LeaseLock, SqliteLeaseLock, Trigger};
use clustercron::storage::{format_ts, Pool};

#[derive(Parser)]
#[command(
    name = "clustercron",
    about = "Cluster-aware cron scheduler with SQLite-backed leases and history",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (overrides CLUSTERCRON_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler daemon
    Serve,

    /// Show recent executions of a task
    History {
        /// Task name
        #[arg(long)]
        task: String,

        /// Maximum number of rows
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show aggregate execution statistics for a task
    Stats {
        /// Task name
        #[arg(long)]
        task: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect or toggle cluster lease rows
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Delete execution history older than N days
    Prune {
        /// Retention in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Validate a schedule expression and preview its next fire times
    CheckSchedule {
        /// Cron expression, descriptor (@daily) or interval (@every 5m)
        expr: String,

        /// Number of fire times to show
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List all lease rows
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Allow a global task to run anywhere in the cluster
    Enable {
        /// Task name
        #[arg(long)]
        task: String,
    },

    /// Stop a global task from running on any node
    Disable {
        /// Task name
        #[arg(long)]
        task: String,
    },
}

/// Resolve configuration with a temporary stderr subscriber installed, so
/// fallback warnings are visible before the configured one exists.
fn resolve_config(explicit: Option<&std::path::Path>) -> Result<ClusterCronConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || ClusterCronConfig::resolve(explicit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the configured database for inspection without creating it.
fn open_existing(config: &ClusterCronConfig) -> Result<Pool> {
    let path = &config.storage.database_path;
    if !clustercron::database_exists(path) {
        bail!("no database at {}", path.display());
    }
    clustercron::open_configured_pool(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            clustercron::serve(&config).await?;
        }
        Commands::History { task, limit, json } => {
            let history = HistoryStore::new(open_existing(&config)?);
            let rows = history.history(&task, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No executions recorded for '{}'.", task);
            } else {
                println!(
                    "{:<24} | {:<16} | {:<9} | {:<7} | {:>10} | Error",
                    "Started", "Node", "Fired by", "Status", "Duration"
                );
                println!("{:-<24}-|-{:-<16}-|-{:-<9}-|-{:-<7}-|-{:->10}-|-{:-<20}", "", "", "", "", "", "");
                for r in rows {
                    println!(
                        "{:<24} | {:<16} | {:<9} | {:<7} | {:>8}ms | {}",
                        format_ts(r.started_at),
                        r.node_id,
                        r.fired_by,
                        r.status,
                        r.duration_ms,
                        r.error.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Stats { task, json } => {
            let history = HistoryStore::new(open_existing(&config)?);
            let stats = history.stats(&task).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Task:         {}", stats.task_name);
                println!("Runs:         {}", stats.total);
                println!("Succeeded:    {}", stats.success);
                println!("Failed:       {}", stats.error);
                match stats.avg_duration_ms {
                    Some(avg) => println!("Avg duration: {:.1}ms", avg),
                    None => println!("Avg duration: -"),
                }
                match stats.last_started_at {
                    Some(ts) => println!("Last run:     {}", format_ts(ts)),
                    None => println!("Last run:     never"),
                }
            }
        }
        Commands::Locks { action } => {
            let lock = SqliteLeaseLock::new(open_existing(&config)?);
            let lease = config.scheduler_options()?.lease_window;
            match action {
                LockAction::List { json } => {
                    let rows = lock.list().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    } else if rows.is_empty() {
                        println!("No lease rows found.");
                    } else {
                        let now = Utc::now();
                        println!("{:<24} | {:<16} | {:<24} | {:<7} | Enabled", "Task", "Holder", "Acquired", "Live");
                        println!("{:-<24}-|-{:-<16}-|-{:-<24}-|-{:-<7}-|-{:-<7}", "", "", "", "", "");
                        for r in rows {
                            let live = r.is_held(now, lease);
                            println!(
                                "{:<24} | {:<16} | {:<24} | {:<7} | {}",
                                r.task_name,
                                r.holder.as_deref().unwrap_or("-"),
                                r.acquired_at.map(format_ts).unwrap_or_else(|| "-".to_string()),
                                live,
                                r.enabled
                            );
                        }
                    }
                }
                LockAction::Enable { task } => {
                    lock.set_enabled(&task, true).await?;
                    println!("Task '{}' enabled cluster-wide.", task);
                }
                LockAction::Disable { task } => {
                    lock.set_enabled(&task, false).await?;
                    println!("Task '{}' disabled cluster-wide.", task);
                }
            }
        }
        Commands::Prune { days } => {
            let days = days.unwrap_or(config.retention.days);
            let history = HistoryStore::new(open_existing(&config)?);
            let deleted = history.prune_older_than(days).await?;
            println!("Deleted {} execution(s) older than {} days.", deleted, days);
        }
        Commands::CheckSchedule { expr, count } => {
            let trigger = Trigger::parse(&expr).context("schedule rejected")?;
            let upcoming = trigger.upcoming(Utc::now(), count);
            println!("Schedule '{}' is valid.", expr);
            if upcoming.is_empty() {
                println!("No upcoming fire times.");
            } else {
                println!("Next {} fire time(s):", upcoming.len());
                for ts in upcoming {
                    println!("  {}", format_ts(ts));
                }
            }
        }
    }

    Ok(())
}
