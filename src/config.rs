//! TOML configuration for the tickwarden daemon.
//!
//! Layered model: an explicit path wins, then the `TICKWARDEN_CONFIG`
//! environment variable, then the standard system location, then compiled-in
//! defaults. Every section is optional.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TICKWARDEN_CONFIG";

/// Standard system config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tickwarden/tickwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickwardenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TickwardenConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicitly requested file must load. The environment and system
    /// fallbacks only warn when broken, then fall through to defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    let error = format!("{:#}", e);
                    warn!(
                        path = %path.display(),
                        %error,
                        "TICKWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    let error = format!("{:#}", e);
                    warn!(
                        path = %system_path.display(),
                        %error,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.poll_interval_secs == 0 {
            anyhow::bail!("scheduler.poll_interval_secs must be greater than zero");
        }
        if s.max_workers == 0 {
            anyhow::bail!("scheduler.max_workers must be greater than zero");
        }
        if s.task_timeout_secs == 0 {
            anyhow::bail!("scheduler.task_timeout_secs must be greater than zero");
        }
        if s.recovery_batch_size == 0 {
            anyhow::bail!("scheduler.recovery_batch_size must be greater than zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file. Parent directories are created on open.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/tickwarden.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Polling, concurrency and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between polls for due tasks.
    pub poll_interval_secs: u64,
    /// Maximum executions running at once, process-wide.
    pub max_workers: usize,
    /// Wall-clock limit for a task without its own timeout.
    pub task_timeout_secs: u64,
    /// How long shutdown waits for in-flight executions. Zero exits at once.
    pub shutdown_grace_secs: u64,
    /// Rows repaired per crash-recovery pass.
    pub recovery_batch_size: usize,
    /// Cap on stored output and error text per execution field.
    pub max_output_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_workers: 5,
            task_timeout_secs: 3600,
            shutdown_grace_secs: 30,
            recovery_batch_size: 100,
            max_output_bytes: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset (`info`, `tickwarden=debug`, ...).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
