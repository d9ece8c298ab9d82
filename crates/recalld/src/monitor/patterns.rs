//! Failure pattern detectors.
//!
//! Pure heuristics over the monitor's bounded histories. Each detector
//! returns an insight string when its pattern holds; insight wording is
//! load-bearing — recommendations are derived by keyword-matching it.

use crate::client::ErrorKind;
use crate::snapshot::SystemSnapshot;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;
use std::collections::VecDeque;

use super::FailurePattern;

/// How many same-type failures the periodic detector looks back over.
const PERIODIC_LOOKBACK: usize = 10;
/// Same hour-of-day occurrences needed for a periodic insight.
const PERIODIC_HOUR_THRESHOLD: usize = 6;
/// Same weekday occurrences needed for a periodic insight.
const PERIODIC_WEEKDAY_THRESHOLD: usize = 4;
/// Same-type failures the size detector averages over.
const SIZE_LOOKBACK: usize = 20;
/// Cascade precursor: more than this many failures inside the window...
const CASCADE_BURST_COUNT: usize = 5;
/// ...within this many seconds, sharing one error type.
const CASCADE_WINDOW_SECS: i64 = 60;
/// Snapshots averaged for the system-correlation detector.
const CORRELATION_SNAPSHOTS: usize = 5;
/// Average RSS above this suggests memory-correlated failures.
const CORRELATION_MEMORY_MB: u64 = 500;
/// Disk I/O above this suggests I/O-correlated failures.
const CORRELATION_DISK_IO_MB_S: f64 = 100.0;

/// Temporal clustering: of the last ≤10 same-type failures, ≥6 sharing an
/// hour-of-day or ≥4 sharing a weekday.
pub fn detect_periodic(history: &VecDeque<FailurePattern>, kind: ErrorKind) -> Option<String> {
    let recent: Vec<&FailurePattern> = history
        .iter()
        .rev()
        .filter(|p| p.error_kind == kind)
        .take(PERIODIC_LOOKBACK)
        .collect();
    if recent.len() < PERIODIC_WEEKDAY_THRESHOLD {
        return None;
    }

    let mut by_hour: HashMap<u32, usize> = HashMap::new();
    let mut by_weekday: HashMap<u32, usize> = HashMap::new();
    for p in &recent {
        *by_hour.entry(p.timestamp.hour()).or_insert(0) += 1;
        *by_weekday
            .entry(p.timestamp.weekday().num_days_from_monday())
            .or_insert(0) += 1;
    }

    if let Some((hour, count)) = by_hour.iter().max_by_key(|(_, c)| **c) {
        if *count >= PERIODIC_HOUR_THRESHOLD {
            return Some(format!(
                "periodic pattern: {} of last {} {} failures occur around {:02}:00 UTC",
                count,
                recent.len(),
                kind,
                hour
            ));
        }
    }
    if let Some((weekday, count)) = by_weekday.iter().max_by_key(|(_, c)| **c) {
        if *count >= PERIODIC_WEEKDAY_THRESHOLD {
            const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
            return Some(format!(
                "periodic pattern: {} of last {} {} failures fall on {}",
                count,
                recent.len(),
                kind,
                DAYS[*weekday as usize % 7]
            ));
        }
    }
    None
}

/// Large-payload correlation: average payload of the last 20 same-type
/// failures above the configured threshold.
pub fn detect_size_correlation(
    history: &VecDeque<FailurePattern>,
    kind: ErrorKind,
    threshold_kb: u64,
) -> Option<String> {
    let sizes: Vec<u64> = history
        .iter()
        .rev()
        .filter(|p| p.error_kind == kind)
        .take(SIZE_LOOKBACK)
        .map(|p| p.file_size)
        .collect();
    if sizes.is_empty() {
        return None;
    }

    let avg = sizes.iter().sum::<u64>() / sizes.len() as u64;
    if avg > threshold_kb * 1024 {
        Some(format!(
            "large payload correlation: {} failures average {}KB over last {} occurrences",
            kind,
            avg / 1024,
            sizes.len()
        ))
    } else {
        None
    }
}

/// Cascade precursor: more than 5 failures inside the last 60s sharing one
/// error type, over the global rolling window.
pub fn detect_cascade_precursor(
    window: &VecDeque<(DateTime<Utc>, ErrorKind)>,
) -> Option<String> {
    let cutoff = Utc::now() - chrono::Duration::seconds(CASCADE_WINDOW_SECS);
    let mut by_kind: HashMap<ErrorKind, usize> = HashMap::new();
    for (_, kind) in window.iter().filter(|(ts, _)| *ts >= cutoff) {
        *by_kind.entry(*kind).or_insert(0) += 1;
    }

    by_kind
        .into_iter()
        .filter(|(_, count)| *count > CASCADE_BURST_COUNT)
        .max_by_key(|(_, count)| *count)
        .map(|(kind, count)| {
            format!(
                "cascade risk: {} {} failures within {}s",
                count, kind, CASCADE_WINDOW_SECS
            )
        })
}

/// Resource correlation: last 5 snapshots averaging >500MB RSS, or the
/// latest disk I/O rate above 100MB/s.
pub fn detect_system_correlation(snapshots: &VecDeque<SystemSnapshot>) -> Option<String> {
    let recent: Vec<&SystemSnapshot> = snapshots
        .iter()
        .rev()
        .take(CORRELATION_SNAPSHOTS)
        .filter(|s| s.error.is_none())
        .collect();
    if recent.is_empty() {
        return None;
    }

    let avg_memory = recent.iter().map(|s| s.memory_usage_mb).sum::<u64>() / recent.len() as u64;
    if avg_memory > CORRELATION_MEMORY_MB {
        return Some(format!(
            "system correlation: failures coincide with high memory use (avg {}MB)",
            avg_memory
        ));
    }

    if let Some(latest) = recent.first() {
        if latest.disk_io_mb_s > CORRELATION_DISK_IO_MB_S {
            return Some(format!(
                "system correlation: failures coincide with heavy disk I/O ({:.0}MB/s)",
                latest.disk_io_mb_s
            ));
        }
    }
    None
}
