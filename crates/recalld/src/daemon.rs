//! Background recovery daemon.
//!
//! One cycle: health-gate the remote service (exponential backoff, 30s floor,
//! 300s cap), drain an adaptively-sized batch from the pending queue
//! sequentially, verify every archive with a read-after-write check, and
//! dead-letter files on their third failed attempt. Scheduling adapts to
//! queue depth; pause is cooperative; stop joins with a timeout and reports
//! rather than forces. Forced and scheduled cycles share a mutex so they
//! never interleave.

use crate::client::{ErrorKind, MemoryServiceClient, ServiceError};
use crate::monitor::{EmergencyAction, EmergencyEvent, FailureInfo, RecoveryMonitor};
use crate::queue::PendingQueue;
use crate::tracker::AttemptTracker;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use recall_common::{LogSink, PendingExchange, RecoveryConfig, Severity, TracingSink};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "daemon";

/// Sleep between iterations after a cycle-level error.
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Mutable daemon state, owned behind one lock.
#[derive(Debug, Default)]
struct DaemonState {
    running: bool,
    paused_until: Option<DateTime<Utc>>,
    current_interval_secs: u64,
    last_health_check: Option<DateTime<Utc>>,
    last_health_ok: Option<bool>,
    backoff_seconds: u64,
    last_failure_time: Option<DateTime<Utc>>,
    total_processed: u64,
    total_succeeded: u64,
    total_failed: u64,
    current_processing_file: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
    last_cycle_at: Option<DateTime<Utc>>,
}

/// Operator-facing snapshot of daemon state.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub current_interval_secs: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_health_ok: Option<bool>,
    pub backoff_seconds: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub current_processing_file: Option<String>,
    pub tracked_retry_files: usize,
    pub dead_lettered: usize,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Result of a synchronously forced recovery cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ForceRecoveryReport {
    pub pending_before: usize,
    pub pending_after: usize,
    pub processed: usize,
    pub duration_ms: u64,
}

/// Outcome of one cycle, internal.
#[derive(Debug, Default)]
struct CycleReport {
    processed: usize,
}

struct Inner {
    config: RecoveryConfig,
    queue: Arc<PendingQueue>,
    client: MemoryServiceClient,
    sink: Arc<dyn LogSink>,
    monitor: Arc<Mutex<RecoveryMonitor>>,
    state: RwLock<DaemonState>,
    tracker: Mutex<AttemptTracker>,
    /// Held around every cycle, scheduled or forced.
    cycle_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// The background recovery daemon.
pub struct RecoveryDaemon {
    inner: Arc<Inner>,
}

impl RecoveryDaemon {
    pub fn new(
        config: RecoveryConfig,
        queue: Arc<PendingQueue>,
        client: MemoryServiceClient,
        monitor: Arc<Mutex<RecoveryMonitor>>,
    ) -> Self {
        Self::with_sink(config, queue, client, monitor, Arc::new(TracingSink))
    }

    pub fn with_sink(
        config: RecoveryConfig,
        queue: Arc<PendingQueue>,
        client: MemoryServiceClient,
        monitor: Arc<Mutex<RecoveryMonitor>>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let backoff = config.backoff_base_secs;
        let interval = config.base_interval_secs;
        let inner = Inner {
            config,
            queue,
            client,
            sink,
            monitor,
            state: RwLock::new(DaemonState {
                backoff_seconds: backoff,
                current_interval_secs: interval,
                ..Default::default()
            }),
            tracker: Mutex::new(AttemptTracker::new()),
            cycle_lock: Mutex::new(()),
            shutdown,
            handle: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start the background loop. Errors if already running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            if state.running {
                bail!("recovery daemon is already running");
            }
            state.running = true;
            state.started_at = Some(Utc::now());
        }
        let _ = self.inner.shutdown.send(false);

        let inner = Arc::clone(&self.inner);
        let rx = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            Inner::run_loop(inner, rx).await;
        });
        *self.inner.handle.lock().await = Some(handle);

        info!("Recovery daemon started");
        Ok(())
    }

    /// Signal shutdown and join with a timeout. Returns whether the loop
    /// actually exited; a timed-out join is reported, never forced.
    pub async fn stop(&self, timeout: Duration) -> Result<bool> {
        let _ = self.inner.shutdown.send(true);

        let handle = self.inner.handle.lock().await.take();
        let Some(handle) = handle else {
            return Ok(true);
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(join) => {
                if let Err(e) = join {
                    warn!("Recovery loop task ended abnormally: {}", e);
                }
                info!("Recovery daemon stopped");
                Ok(true)
            }
            Err(_) => {
                self.inner.sink.log(
                    Severity::HighDegrade,
                    COMPONENT,
                    &format!(
                        "Recovery loop did not exit within {:?}; it will stop between files",
                        timeout
                    ),
                );
                Ok(false)
            }
        }
    }

    /// Pause recovery work for the given number of minutes; auto-expires.
    pub async fn pause(&self, minutes: u64) {
        let until = Utc::now() + ChronoDuration::minutes(minutes as i64);
        self.inner.state.write().await.paused_until = Some(until);
        info!("Recovery paused until {}", until);
    }

    /// Clear any pause immediately.
    pub async fn resume(&self) {
        self.inner.state.write().await.paused_until = None;
        info!("Recovery resumed");
    }

    /// Run exactly one cycle now, outside the schedule. Fails fast when the
    /// daemon is not running. Shares the cycle mutex with the scheduled loop.
    pub async fn force_recovery_now(&self) -> Result<ForceRecoveryReport> {
        if !self.inner.state.read().await.running {
            bail!("recovery daemon is not running");
        }

        let started = Instant::now();
        let pending_before = self.inner.queue.count();

        let report = {
            let _guard = self.inner.cycle_lock.lock().await;
            self.inner.run_cycle().await?
        };

        Ok(ForceRecoveryReport {
            pending_before,
            pending_after: self.inner.queue.count(),
            processed: report.processed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Full operator status snapshot (copies, never live references).
    pub async fn get_recovery_status(&self) -> DaemonStatus {
        let state = self.inner.state.read().await;
        let tracker = self.inner.tracker.lock().await;
        DaemonStatus {
            running: state.running,
            paused_until: state.paused_until,
            current_interval_secs: state.current_interval_secs,
            last_health_check: state.last_health_check,
            last_health_ok: state.last_health_ok,
            backoff_seconds: state.backoff_seconds,
            last_failure_time: state.last_failure_time,
            pending_count: self.inner.queue.count(),
            current_processing_file: state
                .current_processing_file
                .as_ref()
                .map(|p| p.display().to_string()),
            tracked_retry_files: tracker.tracked_count(),
            dead_lettered: self.inner.queue.dead_letter_count(),
            total_processed: state.total_processed,
            total_succeeded: state.total_succeeded,
            total_failed: state.total_failed,
            started_at: state.started_at,
            last_cycle_at: state.last_cycle_at,
        }
    }

    /// Evaluate emergency conditions and apply any actions they demand.
    pub async fn run_emergency_sweep(&self) -> Vec<EmergencyEvent> {
        Inner::apply_emergencies(&self.inner).await
    }
}

impl Inner {
    async fn run_loop(inner: Arc<Inner>, mut rx: watch::Receiver<bool>) {
        info!("Recovery loop running");
        loop {
            if *rx.borrow() {
                break;
            }

            // Cooperative pause: no work, short re-check sleep.
            if inner.pause_active().await {
                if sleep_interruptible(&mut rx, Duration::from_secs(inner.config.pause_poll_secs))
                    .await
                {
                    break;
                }
                continue;
            }

            let sleep_for = {
                let _guard = inner.cycle_lock.lock().await;
                match inner.run_cycle().await {
                    Ok(_) => Duration::from_secs(inner.state.read().await.current_interval_secs),
                    Err(e) => {
                        // A broken cycle must not take the process down.
                        error!("Recovery cycle failed: {}", e);
                        ERROR_SLEEP
                    }
                }
            };

            // Emergencies are evaluated outside the cycle lock so a forced
            // cycle is never blocked behind compression or bundle writes.
            Self::apply_emergencies(&inner).await;

            if *rx.borrow() {
                break;
            }
            if sleep_interruptible(&mut rx, sleep_for).await {
                break;
            }
        }

        inner.state.write().await.running = false;
        info!("Recovery loop exited");
    }

    async fn apply_emergencies(inner: &Arc<Inner>) -> Vec<EmergencyEvent> {
        let events = {
            let mut monitor = inner.monitor.lock().await;
            monitor
                .check_emergency_conditions(&inner.queue, &inner.client)
                .await
        };
        for event in &events {
            for action in &event.actions {
                match action {
                    EmergencyAction::PauseRecovery { minutes } => {
                        let until = Utc::now() + ChronoDuration::minutes(*minutes as i64);
                        inner.state.write().await.paused_until = Some(until);
                        warn!("Emergency pause until {}", until);
                    }
                    EmergencyAction::StopRecovery => {
                        inner.sink.log(
                            Severity::CriticalStop,
                            COMPONENT,
                            "Stopping recovery daemon on emergency request",
                        );
                        let _ = inner.shutdown.send(true);
                    }
                    EmergencyAction::AdvisePauseWrites
                    | EmergencyAction::AdviseShrinkBuffers
                    | EmergencyAction::CompressedBackups { .. } => {}
                }
            }
        }
        events
    }

    /// True while a pause is in effect; clears expired pauses.
    async fn pause_active(&self) -> bool {
        let mut state = self.state.write().await;
        match state.paused_until {
            Some(until) if Utc::now() < until => true,
            Some(_) => {
                state.paused_until = None;
                info!("Pause expired, resuming recovery");
                false
            }
            None => false,
        }
    }

    /// One recovery cycle. Updates `current_interval_secs` for the caller.
    async fn run_cycle(&self) -> Result<CycleReport> {
        self.state.write().await.last_cycle_at = Some(Utc::now());

        if !self.health_gate().await? {
            return Ok(CycleReport::default());
        }

        let pending = self.queue.list()?;
        if pending.is_empty() {
            self.set_interval(self.config.idle_interval_secs).await;
            return Ok(CycleReport::default());
        }

        let batch = batch_size(pending.len());
        debug!(
            "Processing batch of {} from {} pending file(s)",
            batch,
            pending.len()
        );

        let mut report = CycleReport::default();
        let mut cycle_succeeded = 0usize;
        for path in pending.iter().take(batch) {
            // Honor stop between files, not mid-file.
            if *self.shutdown.borrow() {
                break;
            }

            let preceding_rate = if report.processed == 0 {
                1.0
            } else {
                cycle_succeeded as f64 / report.processed as f64
            };

            self.state.write().await.current_processing_file = Some(path.clone());
            let outcome = self.process_file(path, preceding_rate).await;
            self.state.write().await.current_processing_file = None;

            report.processed += 1;
            if outcome {
                cycle_succeeded += 1;
            }
        }

        let remaining = self.queue.count();
        let next = if remaining == 0 {
            self.config.idle_interval_secs
        } else if remaining > self.config.aggressive_queue_threshold {
            self.config.aggressive_interval_secs
        } else {
            self.config.base_interval_secs
        };
        self.set_interval(next).await;

        Ok(report)
    }

    /// Health-check gate. Returns false when the cycle should be skipped.
    async fn health_gate(&self) -> Result<bool> {
        // Inside the backoff window since the last failed probe: don't even
        // touch the network.
        {
            let state = self.state.read().await;
            if let Some(last_failure) = state.last_failure_time {
                let window = ChronoDuration::seconds(state.backoff_seconds as i64);
                if state.last_health_ok == Some(false) && Utc::now() - last_failure < window {
                    debug!(
                        "Within health backoff window ({}s), skipping cycle",
                        state.backoff_seconds
                    );
                    return Ok(false);
                }
            }
        }

        let started = Instant::now();
        let result = self.client.health().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.monitor.lock().await.record_latency("health", latency_ms);

        let mut state = self.state.write().await;
        state.last_health_check = Some(Utc::now());
        match result {
            Ok(()) => {
                state.last_health_ok = Some(true);
                state.backoff_seconds = self.config.backoff_base_secs;
                state.last_failure_time = None;
                Ok(true)
            }
            Err(e) => {
                // First failure waits the floor; each consecutive failure
                // doubles the wait up to the cap.
                if state.last_health_ok == Some(false) {
                    state.backoff_seconds =
                        (state.backoff_seconds * 2).min(self.config.backoff_max_secs);
                }
                state.last_health_ok = Some(false);
                state.last_failure_time = Some(Utc::now());
                drop(state);

                self.sink.log(
                    Severity::MediumAlert,
                    COMPONENT,
                    &format!("Memory service health check failed: {}", e),
                );
                Ok(false)
            }
        }
    }

    /// Process one pending file; true on verified success.
    async fn process_file(&self, path: &Path, preceding_rate: f64) -> bool {
        let parsed = parse_pending(path);

        let result = match &parsed {
            Ok(exchange) => self.archive_and_verify(exchange).await,
            Err(e) => Err(e.clone()),
        };

        match result {
            Ok(()) => {
                {
                    let mut state = self.state.write().await;
                    state.total_processed += 1;
                    state.total_succeeded += 1;
                }
                self.tracker.lock().await.purge(path);
                if let Err(e) = self.queue.remove(path) {
                    // The exchange is archived; a lingering file only means a
                    // duplicate replay next cycle (at-least-once).
                    warn!("Failed to delete recovered file {}: {}", path.display(), e);
                }
                debug!("Recovered {}", path.display());
                true
            }
            Err(err) => {
                {
                    let mut state = self.state.write().await;
                    state.total_processed += 1;
                    state.total_failed += 1;
                }
                self.handle_failure(path, &parsed.ok(), err, preceding_rate)
                    .await;
                false
            }
        }
    }

    async fn archive_and_verify(&self, exchange: &PendingExchange) -> Result<(), ServiceError> {
        let started = Instant::now();
        let archive_result = self.client.archive(&exchange.archive_body()).await;
        self.monitor
            .lock()
            .await
            .record_latency("archive", started.elapsed().as_millis() as u64);
        archive_result?;

        let started = Instant::now();
        let verify_result = self.client.verify(&exchange.exchange_id).await;
        self.monitor
            .lock()
            .await
            .record_latency("verify", started.elapsed().as_millis() as u64);
        verify_result
    }

    /// Record the failure, report it to the monitor, dead-letter at strike 3.
    async fn handle_failure(
        &self,
        path: &Path,
        exchange: &Option<PendingExchange>,
        err: ServiceError,
        preceding_rate: f64,
    ) {
        let attempts = {
            let mut tracker = self.tracker.lock().await;
            tracker.record_failure(path, err.kind, &err.message)
        };

        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let info = FailureInfo {
            file: path.to_path_buf(),
            error_kind: err.kind,
            error: err.message.clone(),
            file_size,
            conversation_id: exchange.as_ref().map(|e| e.conversation_id.clone()),
            exchange_age_hours: exchange
                .as_ref()
                .map(|e| (Utc::now() - e.timestamp).num_minutes() as f64 / 60.0),
            preceding_success_rate: preceding_rate,
        };
        self.monitor.lock().await.analyze_failure(info);

        if attempts >= self.config.max_attempts {
            match self.queue.dead_letter(path, err.kind.as_str()) {
                Ok(_) => {}
                Err(e) => warn!("Dead-letter of {} failed: {}", path.display(), e),
            }
            self.tracker.lock().await.purge(path);
        } else {
            self.sink.log(
                Severity::MediumAlert,
                COMPONENT,
                &format!(
                    "Attempt {}/{} failed for {}: {}",
                    attempts,
                    self.config.max_attempts,
                    path.display(),
                    err
                ),
            );
        }
    }

    async fn set_interval(&self, secs: u64) {
        self.state.write().await.current_interval_secs = secs;
    }
}

/// Batch size from queue depth: bounds per-cycle latency while still
/// draining large backlogs.
fn batch_size(pending: usize) -> usize {
    match pending {
        0 => 0,
        n if n <= 5 => n,
        n if n <= 20 => 5,
        n if n <= 50 => 8,
        _ => 12,
    }
}

/// Parse one pending file; a missing or empty `exchange_id`, like any other
/// parse problem, classifies as data corruption.
fn parse_pending(path: &Path) -> Result<PendingExchange, ServiceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ServiceError::new(
            ErrorKind::DataCorruption,
            format!("unreadable pending file: {}", e),
        )
    })?;

    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        ServiceError::new(ErrorKind::DataCorruption, format!("invalid JSON: {}", e))
    })?;
    match value.get("exchange_id").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => {}
        _ => {
            return Err(ServiceError::new(
                ErrorKind::DataCorruption,
                "pending file has no exchange_id",
            ))
        }
    }

    serde_json::from_value(value).map_err(|e| {
        ServiceError::new(
            ErrorKind::DataCorruption,
            format!("pending file does not match exchange schema: {}", e),
        )
    })
}

/// Sleep that wakes on shutdown; returns true when interrupted by shutdown.
async fn sleep_interruptible(rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *rx.borrow(),
        changed = rx.changed() => {
            changed.is_ok() && *rx.borrow()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_breakpoints() {
        assert_eq!(batch_size(0), 0);
        assert_eq!(batch_size(1), 1);
        assert_eq!(batch_size(5), 5);
        assert_eq!(batch_size(6), 5);
        assert_eq!(batch_size(20), 5);
        assert_eq!(batch_size(21), 8);
        assert_eq!(batch_size(50), 8);
        assert_eq!(batch_size(51), 12);
        assert_eq!(batch_size(10_000), 12);
    }

    #[test]
    fn test_batch_size_monotonic_and_capped() {
        let mut last = 0;
        for n in 0..200 {
            let b = batch_size(n);
            assert!(b >= last, "batch shrank at {}: {} < {}", n, b, last);
            assert!(b <= 12);
            last = b;
        }
    }

    #[test]
    fn test_parse_pending_missing_exchange_id() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), r#"{"conversation_id": "c", "user": "q"}"#).unwrap();

        let err = parse_pending(temp.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataCorruption);
        assert!(err.message.contains("exchange_id"));
    }

    #[test]
    fn test_parse_pending_invalid_json() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "{truncated").unwrap();

        let err = parse_pending(temp.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataCorruption);
    }

    #[test]
    fn test_parse_pending_valid() {
        let exchange = PendingExchange::new("conv-9", "hello", "hi");
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), serde_json::to_string(&exchange).unwrap()).unwrap();

        let parsed = parse_pending(temp.path()).unwrap();
        assert_eq!(parsed.exchange_id, exchange.exchange_id);
    }
}
