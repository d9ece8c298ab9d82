//! Per-file attempt bookkeeping for the 3-strike rule.
//!
//! An entry exists iff the file has 1–2 recorded failures; it is purged on
//! verified success and on dead-lettering. State is in-memory only and owned
//! by the daemon; a restart forgives prior strikes.

use crate::client::ErrorKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Recorded failures for one pending file.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempts: Vec<DateTime<Utc>>,
    pub last_error: String,
    pub error_kind: ErrorKind,
}

impl AttemptRecord {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.attempts.last().copied()
    }
}

/// Map of pending-file path to its failure record.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    records: HashMap<PathBuf, AttemptRecord>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failed attempt; returns the new attempt count.
    pub fn record_failure(&mut self, path: &Path, kind: ErrorKind, error: &str) -> u32 {
        let record = self
            .records
            .entry(path.to_path_buf())
            .or_insert_with(|| AttemptRecord {
                attempts: Vec::new(),
                last_error: String::new(),
                error_kind: kind,
            });
        record.attempts.push(Utc::now());
        record.last_error = error.to_string();
        record.error_kind = kind;
        record.attempt_count()
    }

    pub fn get(&self, path: &Path) -> Option<&AttemptRecord> {
        self.records.get(path)
    }

    pub fn attempt_count(&self, path: &Path) -> u32 {
        self.records.get(path).map(|r| r.attempt_count()).unwrap_or(0)
    }

    /// Drop tracking for a file (success or dead-letter).
    pub fn purge(&mut self, path: &Path) {
        self.records.remove(path);
    }

    /// Files currently carrying at least one strike.
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strikes_accumulate_per_file() {
        let mut tracker = AttemptTracker::new();
        let a = Path::new("/tmp/a.json");
        let b = Path::new("/tmp/b.json");

        assert_eq!(tracker.record_failure(a, ErrorKind::NetworkTimeout, "timed out"), 1);
        assert_eq!(tracker.record_failure(a, ErrorKind::ServerError, "500"), 2);
        assert_eq!(tracker.record_failure(b, ErrorKind::RateLimited, "429"), 1);

        assert_eq!(tracker.attempt_count(a), 2);
        assert_eq!(tracker.attempt_count(b), 1);
        assert_eq!(tracker.tracked_count(), 2);

        // Latest classification wins.
        assert_eq!(tracker.get(a).unwrap().error_kind, ErrorKind::ServerError);
        assert_eq!(tracker.get(a).unwrap().last_error, "500");
        assert!(tracker.get(a).unwrap().last_attempt().is_some());
    }

    #[test]
    fn test_purge_resets_count() {
        let mut tracker = AttemptTracker::new();
        let a = Path::new("/tmp/a.json");

        tracker.record_failure(a, ErrorKind::NetworkTimeout, "timed out");
        tracker.purge(a);

        assert_eq!(tracker.attempt_count(a), 0);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.get(a).is_none());
    }

    #[test]
    fn test_purge_unknown_is_noop() {
        let mut tracker = AttemptTracker::new();
        tracker.purge(Path::new("/tmp/never-seen.json"));
        assert_eq!(tracker.tracked_count(), 0);
    }
}
