//! Recovery monitor.
//!
//! Consumes failure events from the daemon, detects systemic patterns
//! (temporal, payload-size, cascade, resource correlation), persists trend
//! analytics, and enforces rate-limited emergency responses. Analysis never
//! raises into the recovery path; everything degrades to partial output.

pub mod emergency;
pub mod patterns;
pub mod trends;

pub use emergency::{AlertLevel, AlertThrottle, EmergencyFlags, EmergencyKind};
pub use trends::{FailureTrends, TrendStore};

use crate::client::{ErrorKind, MemoryServiceClient};
use crate::queue::PendingQueue;
use crate::snapshot::{SnapshotCollector, SystemSnapshot};
use chrono::{DateTime, Utc};
use recall_common::{LogSink, RecoveryConfig, Severity, TracingSink};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

const COMPONENT: &str = "monitor";

/// Bounded history sizes: failures / cascade window / snapshots.
const MAX_FAILURES: usize = 100;
const CASCADE_WINDOW: usize = 20;
const MAX_SNAPSHOTS: usize = 10;
/// Global failures that must share one type for the cascade emergency.
const CASCADE_RUN: usize = 10;
/// Pause applied when cascade remediation finds the service unreachable.
const CASCADE_PAUSE_MINUTES: u64 = 30;

/// One failure event as reported by the daemon.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub file: PathBuf,
    pub error_kind: ErrorKind,
    pub error: String,
    pub file_size: u64,
    pub conversation_id: Option<String>,
    pub exchange_age_hours: Option<f64>,
    /// Success rate over the cycle's preceding attempts.
    pub preceding_success_rate: f64,
}

/// Retained shape of a failure inside the bounded history.
#[derive(Debug, Clone)]
pub struct FailurePattern {
    pub timestamp: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub file_size: u64,
    pub conversation_id: Option<String>,
    pub exchange_age_hours: Option<f64>,
    pub preceding_success_rate: f64,
}

/// What an emergency asks the caller to do.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyAction {
    /// Pause the recovery daemon for this many minutes.
    PauseRecovery { minutes: u64 },
    /// Stop the recovery daemon outright.
    StopRecovery,
    /// Siblings should stop producing new pending writes.
    AdvisePauseWrites,
    /// Siblings should shrink their in-memory buffers.
    AdviseShrinkBuffers,
    /// Stale backups were compressed as part of handling.
    CompressedBackups { count: usize },
}

/// One emergency condition that fired this check.
#[derive(Debug, Clone)]
pub struct EmergencyEvent {
    pub kind: EmergencyKind,
    pub message: String,
    pub actions: Vec<EmergencyAction>,
}

/// Incremental per-operation latency stats.
#[derive(Debug, Clone, Copy, Default)]
struct OpStats {
    mean_ms: f64,
    count: u64,
}

/// Failure-pattern and emergency monitor for the recovery subsystem.
pub struct RecoveryMonitor {
    config: RecoveryConfig,
    sink: Arc<dyn LogSink>,
    collector: SnapshotCollector,
    trend_store: TrendStore,
    failures: VecDeque<FailurePattern>,
    cascade_window: VecDeque<(DateTime<Utc>, ErrorKind)>,
    snapshots: VecDeque<SystemSnapshot>,
    flags: EmergencyFlags,
    throttle: AlertThrottle,
    latencies: BTreeMap<String, OpStats>,
    last_latency_ms: Option<u64>,
}

impl RecoveryMonitor {
    pub fn new(config: RecoveryConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: RecoveryConfig, sink: Arc<dyn LogSink>) -> Self {
        let trend_store = TrendStore::new(config.backup_root.join("analytics"));
        Self {
            config,
            sink,
            collector: SnapshotCollector::new(),
            trend_store,
            failures: VecDeque::new(),
            cascade_window: VecDeque::new(),
            snapshots: VecDeque::new(),
            flags: EmergencyFlags::default(),
            throttle: AlertThrottle::new(),
            latencies: BTreeMap::new(),
            last_latency_ms: None,
        }
    }

    /// Record one operation latency (health/archive/verify).
    pub fn record_latency(&mut self, operation: &str, ms: u64) {
        let stats = self.latencies.entry(operation.to_string()).or_default();
        stats.count += 1;
        stats.mean_ms += (ms as f64 - stats.mean_ms) / stats.count as f64;
        self.last_latency_ms = Some(ms);
    }

    /// Analyze one failure: snapshot the system, update histories, run the
    /// detectors, and persist analytics. Returns the insights produced.
    pub fn analyze_failure(&mut self, info: FailureInfo) -> Vec<String> {
        self.sink.log(
            Severity::LowDebug,
            COMPONENT,
            &format!(
                "analyzing {} failure for {}: {}",
                info.error_kind,
                info.file.display(),
                info.error
            ),
        );

        let snapshot = self.collector.collect(
            &self.config.backup_root,
            self.failures.len(),
            self.last_latency_ms,
        );

        let pattern = FailurePattern {
            timestamp: Utc::now(),
            error_kind: info.error_kind,
            file_size: info.file_size,
            conversation_id: info.conversation_id.clone(),
            exchange_age_hours: info.exchange_age_hours,
            preceding_success_rate: info.preceding_success_rate,
        };

        push_bounded(&mut self.failures, pattern.clone(), MAX_FAILURES);
        push_bounded(
            &mut self.cascade_window,
            (pattern.timestamp, pattern.error_kind),
            CASCADE_WINDOW,
        );
        push_bounded(&mut self.snapshots, snapshot, MAX_SNAPSHOTS);

        let mut insights = Vec::new();
        if let Some(i) = patterns::detect_periodic(&self.failures, info.error_kind) {
            insights.push(i);
        }
        if let Some(i) = patterns::detect_size_correlation(
            &self.failures,
            info.error_kind,
            self.config.payload_threshold_kb,
        ) {
            insights.push(i);
        }
        if let Some(i) = patterns::detect_cascade_precursor(&self.cascade_window) {
            insights.push(i);
        }
        if let Some(i) = patterns::detect_system_correlation(&self.snapshots) {
            insights.push(i);
        }

        for insight in &insights {
            self.sink.log(Severity::MediumAlert, COMPONENT, insight);
        }

        self.trend_store.record(&pattern, &insights);
        insights
    }

    /// Evaluate the four emergency conditions. Each is one-shot-latched; the
    /// returned actions are applied by the caller (the daemon owns its own
    /// lifecycle, the monitor only decides).
    pub async fn check_emergency_conditions(
        &mut self,
        queue: &PendingQueue,
        client: &MemoryServiceClient,
    ) -> Vec<EmergencyEvent> {
        let mut events = Vec::new();
        let pending_count = queue.count();

        // Backlog explosion: queue depth past the threshold.
        if pending_count > self.config.backlog_threshold
            && self.flags.latch(EmergencyKind::BacklogExplosion)
        {
            let message = format!(
                "Backlog explosion: {} pending exchanges (threshold {}); pause new writes",
                pending_count, self.config.backlog_threshold
            );
            if self.throttle.should_alert(AlertLevel::Warning) {
                self.sink.log(Severity::HighDegrade, COMPONENT, &message);
            }
            events.push(EmergencyEvent {
                kind: EmergencyKind::BacklogExplosion,
                message,
                actions: vec![EmergencyAction::AdvisePauseWrites],
            });
        }

        // Cascade failure: last 10 global failures share one error type.
        if let Some(kind) = self.cascade_run_kind() {
            if self.flags.latch(EmergencyKind::CascadeFailure) {
                events.push(self.handle_cascade(queue, client, kind).await);
            }
        }

        // Memory pressure: daemon RSS past the threshold.
        let snapshot =
            self.collector
                .collect(&self.config.backup_root, pending_count, self.last_latency_ms);
        if snapshot.error.is_none()
            && snapshot.memory_usage_mb > self.config.memory_threshold_mb
            && self.flags.latch(EmergencyKind::MemoryPressure)
        {
            let message = format!(
                "Memory pressure: daemon RSS {}MB (threshold {}MB); shrink sibling buffers",
                snapshot.memory_usage_mb, self.config.memory_threshold_mb
            );
            if self.throttle.should_alert(AlertLevel::Warning) {
                self.sink.log(Severity::HighDegrade, COMPONENT, &message);
            }
            events.push(EmergencyEvent {
                kind: EmergencyKind::MemoryPressure,
                message,
                actions: vec![EmergencyAction::AdviseShrinkBuffers],
            });
        }

        // Disk exhaustion: staged thresholds, each gated by the throttle.
        if snapshot.error.is_none() {
            if let Some(event) = self.check_disk(snapshot.disk_free_gb) {
                events.push(event);
            }
        }

        events
    }

    /// Error type shared by the last `CASCADE_RUN` global failures, if any.
    fn cascade_run_kind(&self) -> Option<ErrorKind> {
        if self.cascade_window.len() < CASCADE_RUN {
            return None;
        }
        let mut run = self.cascade_window.iter().rev().take(CASCADE_RUN);
        let (_, first) = run.next()?;
        run.all(|(_, k)| k == first).then_some(*first)
    }

    async fn handle_cascade(
        &mut self,
        queue: &PendingQueue,
        client: &MemoryServiceClient,
        kind: ErrorKind,
    ) -> EmergencyEvent {
        let bundle = json!({
            "detected_at": Utc::now().to_rfc3339(),
            "error_type": kind.as_str(),
            "pending_count": queue.count(),
            "recent_failures": self.cascade_window
                .iter()
                .map(|(ts, k)| json!({"timestamp": ts.to_rfc3339(), "error_type": k.as_str()}))
                .collect::<Vec<_>>(),
            "snapshots": self.snapshots.iter().collect::<Vec<_>>(),
            "active_emergencies": self.flags.active(),
        });

        let bundle_note = match emergency::write_cascade_bundle(&queue.analytics_dir(), &bundle) {
            Ok(path) => format!("debug bundle at {}", path.display()),
            Err(e) => format!("debug bundle failed: {}", e),
        };

        // Narrow auto-remediation: probe the service; back off hard when it
        // is unreachable, otherwise leave scheduling alone.
        let mut actions = Vec::new();
        let remediation = match client.health().await {
            Ok(()) => "service reachable, no automatic pause".to_string(),
            Err(e) => {
                actions.push(EmergencyAction::PauseRecovery {
                    minutes: CASCADE_PAUSE_MINUTES,
                });
                format!(
                    "service unreachable ({}), pausing recovery {} minutes",
                    e, CASCADE_PAUSE_MINUTES
                )
            }
        };

        let message = format!(
            "Cascade failure: last {} failures all {} — {}; {}",
            CASCADE_RUN,
            kind.as_str(),
            bundle_note,
            remediation
        );
        if self.throttle.should_alert(AlertLevel::Critical) {
            self.sink.log(Severity::CriticalStop, COMPONENT, &message);
        }
        EmergencyEvent {
            kind: EmergencyKind::CascadeFailure,
            message,
            actions,
        }
    }

    fn check_disk(&mut self, free_gb: u64) -> Option<EmergencyEvent> {
        let [info_gb, warning_gb, critical_gb, emergency_gb] = self.config.disk_thresholds_gb;

        let (level, severity) = if free_gb < emergency_gb {
            (AlertLevel::Emergency, Severity::CriticalStop)
        } else if free_gb < critical_gb {
            (AlertLevel::Critical, Severity::CriticalStop)
        } else if free_gb < warning_gb {
            (AlertLevel::Warning, Severity::HighDegrade)
        } else if free_gb < info_gb {
            (AlertLevel::Info, Severity::MediumAlert)
        } else {
            return None;
        };

        if !self.throttle.should_alert(level) {
            return None;
        }

        let mut actions = Vec::new();
        let mut notes = Vec::new();

        if matches!(level, AlertLevel::Critical | AlertLevel::Emergency) {
            self.flags.latch(EmergencyKind::DiskCritical);

            if level == AlertLevel::Emergency {
                actions.push(EmergencyAction::StopRecovery);
                notes.push("stopping recovery daemon".to_string());
            }
            match emergency::compress_stale_backups(
                &self.config.backup_root,
                self.config.compress_after_days,
            ) {
                Ok(count) => {
                    actions.push(EmergencyAction::CompressedBackups { count });
                    notes.push(format!("compressed {} stale backup file(s)", count));
                }
                Err(e) => notes.push(format!("compression failed: {}", e)),
            }
        }

        let message = format!(
            "Disk space low: {}GB free ({:?}){}",
            free_gb,
            level,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" — {}", notes.join(", "))
            }
        );
        self.sink.log(severity, COMPONENT, &message);

        Some(EmergencyEvent {
            kind: EmergencyKind::DiskCritical,
            message,
            actions,
        })
    }

    /// Currently latched emergency flags.
    pub fn emergency_flags(&self) -> EmergencyFlags {
        self.flags
    }

    /// Operator-driven clear of one latched emergency.
    pub fn reset_emergency(&mut self, kind: EmergencyKind) {
        self.flags.reset(kind);
    }

    /// One-line summary plus active emergencies; verbose adds latency
    /// percentiles, trend summary, a live snapshot, and recommendations.
    pub fn comprehensive_status(&mut self, pending_count: usize, verbose: bool) -> Value {
        let trends = self.trend_store.load();
        let active = self.flags.active();

        let summary = format!(
            "{} pending, {} failure(s) in history, {} active emergencies, {} hotspot(s)",
            pending_count,
            self.failures.len(),
            active.len(),
            trends.hotspots.len()
        );

        let mut status = json!({
            "summary": summary,
            "active_emergencies": active,
        });

        if verbose {
            let snapshot =
                self.collector
                    .collect(&self.config.backup_root, pending_count, self.last_latency_ms);
            let recommendations = self.prioritized_recommendations(&trends);
            status["latency_percentiles"] = self
                .approx_percentiles()
                .map(|(p50, p95, p99)| json!({"p50_ms": p50, "p95_ms": p95, "p99_ms": p99}))
                .unwrap_or(Value::Null);
            status["trend_summary"] = json!(trends.summary());
            status["snapshot"] = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
            status["recommendations"] = json!(recommendations);
        }

        status
    }

    /// Approximate percentiles: replicate each operation's mean by its count,
    /// sort, index at 50/95/99%. Coarse, but cheap and stable.
    fn approx_percentiles(&self) -> Option<(f64, f64, f64)> {
        let mut replicated: Vec<f64> = Vec::new();
        for stats in self.latencies.values() {
            for _ in 0..stats.count {
                replicated.push(stats.mean_ms);
            }
        }
        if replicated.is_empty() {
            return None;
        }
        replicated.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let index = |pct: usize| {
            let i = replicated.len() * pct / 100;
            replicated[i.min(replicated.len() - 1)]
        };
        Some((index(50), index(95), index(99)))
    }

    /// Recommendations ordered cascade > memory > periodic > spike.
    fn prioritized_recommendations(&self, trends: &FailureTrends) -> Vec<String> {
        trends::recommendations(&trends.insights, &trends.hotspots)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(item);
}
