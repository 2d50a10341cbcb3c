//! Pipeline configuration (TOML).
//!
//! Every field has a default, so an empty file (or no file) gives the
//! documented behaviour: poll every 5s, batches of 10, 3 attempts with 1s
//! exponential backoff, 5 workers, 100 jobs/hour globally, 10/hour per sender.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{BackoffPolicy, JobOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Default log filter when neither `HERALD_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl HeraldConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: HeraldConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.scheduler.poll_interval_ms == 0, "scheduler.poll_interval_ms must be > 0"),
            (self.scheduler.batch_size == 0, "scheduler.batch_size must be > 0"),
            (self.queue.max_attempts == 0, "queue.max_attempts must be > 0"),
            (self.queue.poll_interval_ms == 0, "queue.poll_interval_ms must be > 0"),
            (self.worker.concurrency == 0, "worker.concurrency must be > 0"),
            (self.worker.global_limit == 0, "worker.global_limit must be > 0"),
            (self.worker.global_window_secs == 0, "worker.global_window_secs must be > 0"),
            (self.worker.sender_limit == 0, "worker.sender_limit must be > 0"),
            (self.worker.sender_window_secs == 0, "worker.sender_window_secs must be > 0"),
            (self.reaper.interval_ms == 0, "reaper.interval_ms must be > 0"),
            (self.reaper.stuck_after_secs == 0, "reaper.stuck_after_secs must be > 0"),
        ];
        if let Some((_, reason)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::Invalid(reason.to_string()));
        }

        if self.store.kind == StoreKind::Sqlite && self.store.sqlite_path.is_none() {
            return Err(ConfigError::Invalid(
                "store.sqlite_path is required when store.kind = \"sqlite\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduler (poller) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between the end of one pass and the start of the next
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Max due messages claimed per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Dispatch queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total attempts per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubles on each further failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_remove_on_success")]
    pub remove_on_success: bool,

    /// Unacknowledged leases are redelivered after this long
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,

    /// How often idle workers re-read the job table (sqlite store only)
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_remove_on_success() -> bool {
    true
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

fn default_queue_poll_interval_ms() -> u64 {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            remove_on_success: default_remove_on_success(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.max_attempts,
            backoff: BackoffPolicy::exponential(Duration::from_millis(self.backoff_base_ms)),
            remove_on_success: self.remove_on_success,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent in-flight jobs
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Jobs handed out per global window, across all senders
    #[serde(default = "default_global_limit")]
    pub global_limit: u32,

    #[serde(default = "default_window_secs")]
    pub global_window_secs: u64,

    /// Deliveries per sender per window
    #[serde(default = "default_sender_limit")]
    pub sender_limit: u64,

    #[serde(default = "default_window_secs")]
    pub sender_window_secs: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_global_limit() -> u32 {
    100
}

fn default_sender_limit() -> u64 {
    10
}

fn default_window_secs() -> u64 {
    3_600
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            global_limit: default_global_limit(),
            global_window_secs: default_window_secs(),
            sender_limit: default_sender_limit(),
            sender_window_secs: default_window_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn global_window(&self) -> Duration {
        Duration::from_secs(self.global_window_secs)
    }

    pub fn sender_window(&self) -> Duration {
        Duration::from_secs(self.sender_window_secs)
    }
}

/// Stuck-claim sweep. Off unless enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_reaper_interval_ms")]
    pub interval_ms: u64,

    /// PROCESSING messages claimed longer ago than this go back to PENDING
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_reaper_interval_ms() -> u64 {
    60_000
}

fn default_stuck_after_secs() -> u64 {
    900
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_reaper_interval_ms(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Where messages and delivery jobs live.
///
/// With `sqlite` the job table shares the message database, so queued jobs
/// survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}
