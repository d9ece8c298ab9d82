//! Recovery configuration.
//!
//! Loads settings from `~/.config/recall/recovery.toml` (or an explicit path)
//! and falls back to defaults on any problem. Every field has a serde default
//! so partial files stay valid across upgrades.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file name under the user config directory.
pub const CONFIG_FILE: &str = "recovery.toml";

/// Recovery & backup subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Root of the backup tree (`pending/`, `failed/`, `analytics/`).
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Base URL of the remote long-term memory service.
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Interval between recovery cycles when the queue is moderately loaded.
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,

    /// Interval when the queue is empty.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// Interval when the queue is above `aggressive_queue_threshold`.
    #[serde(default = "default_aggressive_interval")]
    pub aggressive_interval_secs: u64,

    /// Queue length above which the aggressive interval kicks in.
    #[serde(default = "default_aggressive_queue_threshold")]
    pub aggressive_queue_threshold: usize,

    /// Re-check cadence while paused.
    #[serde(default = "default_pause_poll")]
    pub pause_poll_secs: u64,

    /// `GET /health` timeout.
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// `POST /archive` timeout.
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout_secs: u64,

    /// `GET /exchange/{id}` verification timeout.
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Health-check backoff floor; backoff resets here after one success.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Health-check backoff ceiling.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Failures per file before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pending count above which the backlog emergency fires.
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: usize,

    /// Daemon RSS above which the memory-pressure emergency fires.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    /// Average payload size above which the size-correlation insight fires.
    #[serde(default = "default_payload_threshold_kb")]
    pub payload_threshold_kb: u64,

    /// Staged free-disk thresholds in GB: info, warning, critical, emergency.
    #[serde(default = "default_disk_thresholds_gb")]
    pub disk_thresholds_gb: [u64; 4],

    /// Age in days after which `.jsonl` backups are eligible for compression.
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u64,
}

fn default_backup_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("recall")
        .join("backups")
}

fn default_service_url() -> String {
    "http://127.0.0.1:8900".to_string()
}

fn default_base_interval() -> u64 {
    30
}

fn default_idle_interval() -> u64 {
    60
}

fn default_aggressive_interval() -> u64 {
    10
}

fn default_aggressive_queue_threshold() -> usize {
    50
}

fn default_pause_poll() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    3
}

fn default_archive_timeout() -> u64 {
    10
}

fn default_verify_timeout() -> u64 {
    5
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backlog_threshold() -> usize {
    500
}

fn default_memory_threshold_mb() -> u64 {
    500
}

fn default_payload_threshold_kb() -> u64 {
    50
}

fn default_disk_thresholds_gb() -> [u64; 4] {
    [50, 20, 5, 1]
}

fn default_compress_after_days() -> u64 {
    1
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            service_url: default_service_url(),
            base_interval_secs: default_base_interval(),
            idle_interval_secs: default_idle_interval(),
            aggressive_interval_secs: default_aggressive_interval(),
            aggressive_queue_threshold: default_aggressive_queue_threshold(),
            pause_poll_secs: default_pause_poll(),
            health_timeout_secs: default_health_timeout(),
            archive_timeout_secs: default_archive_timeout(),
            verify_timeout_secs: default_verify_timeout(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            max_attempts: default_max_attempts(),
            backlog_threshold: default_backlog_threshold(),
            memory_threshold_mb: default_memory_threshold_mb(),
            payload_threshold_kb: default_payload_threshold_kb(),
            disk_thresholds_gb: default_disk_thresholds_gb(),
            compress_after_days: default_compress_after_days(),
        }
    }
}

impl RecoveryConfig {
    /// Default config file path (`~/.config/recall/recovery.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("recall")
            .join(CONFIG_FILE)
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Load from the default path, falling back to defaults with a warning.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config load failed ({}), using defaults", e);
                Self::default()
            }
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}
