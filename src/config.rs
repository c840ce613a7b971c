//! Engine configuration for the Maestro-Hive kernel.
//!
//! Reads `hive.toml` with layered overrides (file → environment → setters).
//! There is no global mutable state: the resolved `EngineConfig` is passed
//! into the supervisor at construction.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_workers = 4
//! global_max_workers = 16
//! max_phase_iterations = 5
//! execution_deadline_secs = 7200
//! event_capacity = 1024
//! events_log = true
//!
//! [storage]
//! checkpoint_root = ".hive/checkpoints"
//! artifact_root = ".hive/artifacts"
//! io_retries = 3
//!
//! [retry]
//! backoff_base_ms = 500
//! backoff_factor = 2.0
//! backoff_max_ms = 30000
//! backoff_jitter = 0.2
//! breaker_threshold = 3
//! breaker_cooldown_secs = 60
//!
//! # Command per executor selector, used by the CLI's process executor
//! [executors]
//! "agent:backend" = ["claude", "-p"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `storage.checkpoint_root`.
pub const ENV_CHECKPOINT_ROOT: &str = "CHECKPOINT_ROOT";
/// Environment variable overriding `storage.artifact_root`.
pub const ENV_ARTIFACT_ROOT: &str = "ARTIFACT_ROOT";
/// Environment variable overriding `engine.max_workers`.
pub const ENV_MAX_WORKERS: &str = "MAX_WORKERS";
/// Environment variable overriding `engine.execution_deadline_secs`.
pub const ENV_EXECUTION_DEADLINE: &str = "EXECUTION_DEADLINE";

/// Scheduler and control-surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Worker bound per execution
    pub max_workers: usize,
    /// Worker bound across all executions
    pub global_max_workers: usize,
    /// Rework iterations allowed per phase
    pub max_phase_iterations: u32,
    /// Wall-clock deadline for one execution; None = unbounded
    pub execution_deadline_secs: Option<u64>,
    /// Event fan-out buffer per subscriber
    pub event_capacity: usize,
    /// Mirror events to `events.log` under the checkpoint directory
    pub events_log: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_workers: 4,
            global_max_workers: 16,
            max_phase_iterations: 5,
            execution_deadline_secs: None,
            event_capacity: 1024,
            events_log: true,
        }
    }
}

/// Durable storage roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub checkpoint_root: PathBuf,
    pub artifact_root: PathBuf,
    /// Attempts per storage write before the error is surfaced
    pub io_retries: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            checkpoint_root: PathBuf::from(".hive/checkpoints"),
            artifact_root: PathBuf::from(".hive/artifacts"),
            io_retries: 3,
        }
    }
}

/// Retry backoff and circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    /// Fraction of the delay randomised away (0.0..=1.0)
    pub backoff_jitter: f64,
    /// Consecutive blocking failures before the breaker opens
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
        }
    }
}

/// The resolved engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub storage: StorageSection,
    pub retry: RetrySection,
    /// Executor selector -> command line, consumed by the CLI wrapper
    pub executors: std::collections::HashMap<String, Vec<String>>,
}

impl EngineConfig {
    /// Load from a `hive.toml` file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    /// Load `hive.toml` if present, otherwise defaults; env always applies.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join("hive.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Apply `CHECKPOINT_ROOT`, `ARTIFACT_ROOT`, `MAX_WORKERS` and
    /// `EXECUTION_DEADLINE` from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var(ENV_CHECKPOINT_ROOT) {
            self.storage.checkpoint_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var(ENV_ARTIFACT_ROOT) {
            self.storage.artifact_root = PathBuf::from(root);
        }
        if let Ok(workers) = std::env::var(ENV_MAX_WORKERS)
            && let Ok(n) = workers.parse::<usize>()
            && n > 0
        {
            self.engine.max_workers = n;
        }
        if let Ok(deadline) = std::env::var(ENV_EXECUTION_DEADLINE)
            && let Ok(secs) = deadline.parse::<u64>()
        {
            self.engine.execution_deadline_secs = Some(secs);
        }
        self
    }

    /// Set the per-execution worker bound.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.engine.max_workers = max;
        self
    }

    /// Set the per-phase rework iteration bound.
    pub fn with_max_phase_iterations(mut self, max: u32) -> Self {
        self.engine.max_phase_iterations = max;
        self
    }

    /// Set both storage roots under one directory.
    pub fn with_storage_root(mut self, root: &Path) -> Self {
        self.storage.checkpoint_root = root.join("checkpoints");
        self.storage.artifact_root = root.join("artifacts");
        self
    }

    pub fn execution_deadline(&self) -> Option<Duration> {
        self.engine.execution_deadline_secs.map(Duration::from_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry.breaker_cooldown_secs)
    }
}
