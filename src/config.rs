//! TOML configuration for the clustercron daemon.
//!
//! Layered model: an explicit path, then the `CLUSTERCRON_CONFIG` environment
//! variable, then `/etc/clustercron/clustercron.toml`, then compiled-in
//! defaults. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::{
    SchedulerOptions, Trigger, DEFAULT_LEASE_WINDOW_SECS, DEFAULT_RETENTION_DAYS,
};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CLUSTERCRON_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/clustercron/clustercron.toml";

/// Upper bound on the lease window (one week).
pub const MAX_LEASE_WINDOW_SECS: u64 = 7 * 24 * 3600;

/// Upper bound on the driver tick (one minute).
pub const MAX_TICK_INTERVAL_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterCronConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClusterCronConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded clustercron configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the fallbacks only
    /// warn and move on. The node id is pinned so every later use agrees.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.node.id = Some(config.node.resolve_id());
        Ok(config)
    }

    /// Reject values that would break scheduling or lease exclusion.
    pub fn validate(&self) -> Result<()> {
        let lease = self.scheduler.lease_window_secs;
        if lease == 0 || lease > MAX_LEASE_WINDOW_SECS {
            bail!(
                "scheduler.lease_window_secs must be between 1 and {MAX_LEASE_WINDOW_SECS}, got {lease}"
            );
        }
        let tick = self.scheduler.tick_interval_ms;
        if tick == 0 || tick > MAX_TICK_INTERVAL_MS {
            bail!(
                "scheduler.tick_interval_ms must be between 1 and {MAX_TICK_INTERVAL_MS}, got {tick}"
            );
        }
        if self.retention.enabled {
            if self.retention.days == 0 {
                bail!("retention.days must be at least 1");
            }
            Trigger::parse(&self.retention.schedule).context("invalid retention.schedule")?;
        }
        Ok(())
    }

    /// Try, in order: `CLUSTERCRON_CONFIG`, the system path, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CLUSTERCRON_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Scheduler options derived from this configuration.
    pub fn scheduler_options(&self) -> Result<SchedulerOptions> {
        let secs = i64::try_from(self.scheduler.lease_window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .filter(|d| *d > chrono::Duration::zero())
            .with_context(|| {
                format!("lease window of {}s is out of range", self.scheduler.lease_window_secs)
            })?;
        Ok(SchedulerOptions::new(self.node.resolve_id())
            .lease_window(secs)
            .tick_interval(StdDuration::from_millis(self.scheduler.tick_interval_ms.max(10))))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-unique identity. Defaults to the host name.
    pub id: Option<String>,
}

impl NodeConfig {
    pub fn resolve_id(&self) -> String {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        match hostname::get().map(|h| h.into_string()) {
            Ok(Ok(name)) if !name.is_empty() => name,
            _ => {
                let id = format!("node-{}", uuid::Uuid::new_v4());
                warn!(%id, "host name unavailable, using generated node id");
                id
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database shared by every node of the cluster.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/clustercron.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub lease_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            lease_window_secs: DEFAULT_LEASE_WINDOW_SECS as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub days: u32,
    /// Schedule of the pruning task.
    pub schedule: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: DEFAULT_RETENTION_DAYS,
            schedule: "@daily".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
