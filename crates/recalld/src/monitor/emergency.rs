//! Emergency condition plumbing.
//!
//! Latched per-condition flags, the per-severity alert throttle, the
//! disk-emergency compression of stale `.jsonl` backups, and cascade debug
//! bundles. The flags latch on first trigger; `reset` exists so an operator
//! can clear one explicitly (the original behavior never cleared them).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The four systemic emergency conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmergencyKind {
    BacklogExplosion,
    CascadeFailure,
    MemoryPressure,
    DiskCritical,
}

impl EmergencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BacklogExplosion => "backlog_explosion",
            Self::CascadeFailure => "cascade_failure",
            Self::MemoryPressure => "memory_pressure",
            Self::DiskCritical => "disk_critical",
        }
    }
}

/// Latched emergency state.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmergencyFlags {
    backlog_explosion: bool,
    cascade_failure: bool,
    memory_pressure: bool,
    disk_critical: bool,
}

impl EmergencyFlags {
    /// Latch a condition; true when this call newly latched it.
    pub fn latch(&mut self, kind: EmergencyKind) -> bool {
        let slot = self.slot_mut(kind);
        let newly = !*slot;
        *slot = true;
        newly
    }

    pub fn is_latched(&self, kind: EmergencyKind) -> bool {
        match kind {
            EmergencyKind::BacklogExplosion => self.backlog_explosion,
            EmergencyKind::CascadeFailure => self.cascade_failure,
            EmergencyKind::MemoryPressure => self.memory_pressure,
            EmergencyKind::DiskCritical => self.disk_critical,
        }
    }

    /// Operator-driven clear of one latched condition.
    pub fn reset(&mut self, kind: EmergencyKind) {
        *self.slot_mut(kind) = false;
    }

    /// Names of currently latched conditions.
    pub fn active(&self) -> Vec<&'static str> {
        [
            EmergencyKind::BacklogExplosion,
            EmergencyKind::CascadeFailure,
            EmergencyKind::MemoryPressure,
            EmergencyKind::DiskCritical,
        ]
        .into_iter()
        .filter(|k| self.is_latched(*k))
        .map(|k| k.as_str())
        .collect()
    }

    fn slot_mut(&mut self, kind: EmergencyKind) -> &mut bool {
        match kind {
            EmergencyKind::BacklogExplosion => &mut self.backlog_explosion,
            EmergencyKind::CascadeFailure => &mut self.cascade_failure,
            EmergencyKind::MemoryPressure => &mut self.memory_pressure,
            EmergencyKind::DiskCritical => &mut self.disk_critical,
        }
    }
}

/// Alert severity buckets with their minimum inter-alert intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    /// Minimum interval between two alerts of this level.
    pub fn window(&self) -> Duration {
        match self {
            Self::Info => Duration::hours(24),
            Self::Warning => Duration::hours(1),
            Self::Critical => Duration::minutes(10),
            Self::Emergency => Duration::minutes(1),
        }
    }
}

/// Rate limiter shared across all emergency types of one severity.
#[derive(Debug, Default)]
pub struct AlertThrottle {
    last_fired: HashMap<AlertLevel, DateTime<Utc>>,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when an alert at this level may fire now; firing arms the window.
    pub fn should_alert(&mut self, level: AlertLevel) -> bool {
        let now = Utc::now();
        match self.last_fired.get(&level) {
            Some(last) if now - *last < level.window() => false,
            _ => {
                self.last_fired.insert(level, now);
                true
            }
        }
    }
}

/// Gzip-compress `.jsonl` backup files directly under `root` older than
/// `older_than_days`, deleting the originals. Returns how many were
/// compressed. The live `pending/*.json` queue is never touched.
pub fn compress_stale_backups(root: &Path, older_than_days: u64) -> Result<usize> {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(older_than_days * 24 * 60 * 60);
    let mut compressed = 0;

    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping {} (no mtime: {})", path.display(), e);
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }

        match compress_one(&path) {
            Ok(()) => {
                compressed += 1;
                info!("Compressed stale backup {}", path.display());
            }
            Err(e) => warn!("Failed to compress {}: {}", path.display(), e),
        }
    }
    Ok(compressed)
}

fn compress_one(path: &Path) -> Result<()> {
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let input = fs::File::open(path)?;
    let output = fs::File::create(&gz_path)?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?.flush()?;

    // Original goes only after the compressed copy is fully written.
    fs::remove_file(path)?;
    Ok(())
}

/// Snapshot a cascade debug bundle to `analytics/cascade_<ts>.json`.
pub fn write_cascade_bundle(analytics_dir: &Path, bundle: &Value) -> Result<PathBuf> {
    fs::create_dir_all(analytics_dir)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = analytics_dir.join(format!("cascade_{}.json", stamp));
    fs::write(&path, serde_json::to_string_pretty(bundle)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
