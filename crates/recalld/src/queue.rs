//! Directory-backed pending queue.
//!
//! Layout under the backup root:
//!   - `pending/*.json`                         — one exchange per file, FIFO by mtime
//!   - `failed/<error_type>/<name>_<ts>.json`   — dead-lettered after 3 strikes
//!   - `analytics/`                             — monitor output (trends, cascade bundles)
//!
//! A file exists in at most one of pending/failed. The only path that
//! discards data is the delete-fallback when a dead-letter rename fails,
//! logged HIGH_DEGRADE so the queue always makes progress.

use anyhow::{Context, Result};
use chrono::Utc;
use recall_common::{LogSink, PendingExchange, Severity, TracingSink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const COMPONENT: &str = "queue";

/// Where a dead-lettered file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    /// Renamed into `failed/<error_type>/`.
    Moved(PathBuf),
    /// Rename failed; the file was deleted so the queue keeps draining.
    Deleted,
}

/// Per-error-type view of the dead-letter tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailedFilesSummary {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    /// Up to three newest file names per error type.
    pub newest: BTreeMap<String, Vec<String>>,
}

/// Durable queue of exchanges awaiting recovery.
pub struct PendingQueue {
    root: PathBuf,
    sink: Arc<dyn LogSink>,
}

impl PendingQueue {
    /// Open (creating if needed) the queue under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_sink(root, Arc::new(TracingSink))
    }

    pub fn with_sink(root: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> Result<Self> {
        let root = root.into();
        for dir in ["pending", "failed", "analytics"] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create {} under {}", dir, root.display()))?;
        }
        Ok(Self { root, sink })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub fn analytics_dir(&self) -> PathBuf {
        self.root.join("analytics")
    }

    /// Atomically write one exchange into `pending/` (tmp + rename).
    ///
    /// This is the backup-writer half of the storage contract: it runs on the
    /// live path whenever a direct archive call fails.
    pub fn enqueue(&self, exchange: &PendingExchange) -> Result<PathBuf> {
        let final_path = self.pending_dir().join(format!("{}.json", exchange.exchange_id));
        let tmp_path = final_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(exchange)?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("Failed to move {} into place", tmp_path.display()))?;

        debug!("Enqueued exchange {} for recovery", exchange.exchange_id);
        Ok(final_path)
    }

    /// Pending `*.json` files, oldest-modified first (best-effort FIFO).
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.pending_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, path));
        }
        entries.sort_by_key(|(modified, _)| *modified);
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Queue depth; degrades to 0 if the directory is unreadable.
    pub fn count(&self) -> usize {
        self.list().map(|files| files.len()).unwrap_or(0)
    }

    /// Delete a pending file after verified success.
    pub fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))
    }

    /// Move a thrice-failed file into `failed/<error_type>/`.
    ///
    /// If the rename fails the file is deleted instead — availability over
    /// durability, the queue must never wedge on one bad file.
    pub fn dead_letter(&self, path: &Path, error_type: &str) -> Result<DeadLetterOutcome> {
        let dest_dir = self.failed_dir().join(error_type);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("exchange");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        // Second-resolution stamps can collide for same-named files; probe
        // with a counter so a rename never overwrites an earlier entry.
        let mut dest = dest_dir.join(format!("{}_{}.json", stem, stamp));
        let mut seq = 1;
        while dest.exists() {
            dest = dest_dir.join(format!("{}_{}_{}.json", stem, stamp, seq));
            seq += 1;
        }

        match fs::rename(path, &dest) {
            Ok(()) => {
                self.sink.log(
                    Severity::HighDegrade,
                    COMPONENT,
                    &format!(
                        "Dead-lettered {} under failed/{}",
                        path.display(),
                        error_type
                    ),
                );
                Ok(DeadLetterOutcome::Moved(dest))
            }
            Err(rename_err) => {
                self.sink.log(
                    Severity::HighDegrade,
                    COMPONENT,
                    &format!(
                        "Dead-letter rename failed for {} ({}); deleting as last resort",
                        path.display(),
                        rename_err
                    ),
                );
                fs::remove_file(path).with_context(|| {
                    format!(
                        "Failed to delete {} after dead-letter rename failure",
                        path.display()
                    )
                })?;
                Ok(DeadLetterOutcome::Deleted)
            }
        }
    }

    /// Count of dead-lettered files across all error types.
    pub fn dead_letter_count(&self) -> usize {
        self.failed_summary().total
    }

    /// Per-error-type counts and newest entries under `failed/`.
    pub fn failed_summary(&self) -> FailedFilesSummary {
        let mut summary = FailedFilesSummary::default();
        let Ok(dirs) = fs::read_dir(self.failed_dir()) else {
            return summary;
        };

        for dir in dirs.flatten() {
            if !dir.path().is_dir() {
                continue;
            }
            let error_type = dir.file_name().to_string_lossy().to_string();
            let Ok(files) = fs::read_dir(dir.path()) else {
                continue;
            };

            let mut named: Vec<(std::time::SystemTime, String)> = files
                .flatten()
                .filter(|f| f.path().extension().and_then(|e| e.to_str()) == Some("json"))
                .map(|f| {
                    let modified = f
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    (modified, f.file_name().to_string_lossy().to_string())
                })
                .collect();
            if named.is_empty() {
                continue;
            }

            named.sort_by(|a, b| b.0.cmp(&a.0));
            summary.total += named.len();
            summary.by_type.insert(error_type.clone(), named.len());
            summary.newest.insert(
                error_type,
                named.into_iter().take(3).map(|(_, name)| name).collect(),
            );
        }

        summary
    }
}
