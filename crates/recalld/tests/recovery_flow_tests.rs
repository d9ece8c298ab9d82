//! End-to-end recovery tests against an in-process mock memory service.
//!
//! The mock exposes the three endpoints the daemon consumes (`/health`,
//! `/archive`, `/exchange/{id}`) with programmable status codes, so every
//! failure class and the verification path can be driven deterministically.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use recall_common::{MemorySink, PendingExchange, RecoveryConfig, Severity};
use recalld::monitor::EmergencyKind;
use recalld::{MemoryServiceClient, PendingQueue, RecoveryDaemon, RecoveryMonitor};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Mock memory service
// ============================================================================

struct MockService {
    health_status: AtomicU16,
    archive_status: AtomicU16,
    /// When false, accepted archives are not visible to the verify endpoint
    /// (simulates a lost write behind a 200 accept-ack).
    durable: AtomicBool,
    /// Delay before the verify endpoint answers, to drive client timeouts.
    verify_delay_ms: AtomicU64,
    stored: Mutex<HashSet<String>>,
    health_hits: AtomicUsize,
    archive_hits: AtomicUsize,
}

impl Default for MockService {
    fn default() -> Self {
        Self {
            health_status: AtomicU16::new(200),
            archive_status: AtomicU16::new(200),
            durable: AtomicBool::new(true),
            verify_delay_ms: AtomicU64::new(0),
            stored: Mutex::new(HashSet::new()),
            health_hits: AtomicUsize::new(0),
            archive_hits: AtomicUsize::new(0),
        }
    }
}

async fn health(State(state): State<Arc<MockService>>) -> StatusCode {
    state.health_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::from_u16(state.health_status.load(Ordering::SeqCst)).unwrap()
}

async fn archive(State(state): State<Arc<MockService>>, Json(body): Json<Value>) -> StatusCode {
    state.archive_hits.fetch_add(1, Ordering::SeqCst);
    let status = state.archive_status.load(Ordering::SeqCst);
    if status == 200 && state.durable.load(Ordering::SeqCst) {
        if let Some(id) = body["exchange_id"].as_str() {
            state.stored.lock().unwrap().insert(id.to_string());
        }
    }
    StatusCode::from_u16(status).unwrap()
}

async fn verify(State(state): State<Arc<MockService>>, Path(id): Path<String>) -> StatusCode {
    let delay = state.verify_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.stored.lock().unwrap().contains(&id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn serve(state: Arc<MockService>) -> String {
    let app = Router::new()
        .route("/health", get(health))
        .route("/archive", post(archive))
        .route("/exchange/:id", get(verify))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    _temp: TempDir,
    mock: Arc<MockService>,
    queue: Arc<PendingQueue>,
    daemon: RecoveryDaemon,
    sink: Arc<MemorySink>,
}

async fn fixture(tune: impl FnOnce(&mut RecoveryConfig)) -> Fixture {
    let temp = TempDir::new().unwrap();
    let mock = Arc::new(MockService::default());
    let url = serve(Arc::clone(&mock)).await;

    let mut config = RecoveryConfig::default();
    config.backup_root = temp.path().to_path_buf();
    config.service_url = url;
    config.pause_poll_secs = 1;
    tune(&mut config);

    let sink = MemorySink::new();
    let queue = Arc::new(PendingQueue::with_sink(temp.path(), sink.clone()).unwrap());
    let client = MemoryServiceClient::new(&config).unwrap();
    let monitor = Arc::new(tokio::sync::Mutex::new(RecoveryMonitor::with_sink(
        config.clone(),
        sink.clone(),
    )));
    let daemon =
        RecoveryDaemon::with_sink(config, Arc::clone(&queue), client, monitor, sink.clone());

    Fixture {
        _temp: temp,
        mock,
        queue,
        daemon,
        sink,
    }
}

/// Start the daemon pre-paused so only forced cycles do work.
async fn start_paused(fx: &Fixture) {
    fx.daemon.pause(60).await;
    fx.daemon.start().await.unwrap();
}

fn enqueue_n(queue: &PendingQueue, n: usize) -> Vec<PendingExchange> {
    (0..n)
        .map(|i| {
            let ex = PendingExchange::new(format!("conv-{}", i), "question", "answer");
            queue.enqueue(&ex).unwrap();
            ex
        })
        .collect()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn successful_recovery_drains_queue() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;
    enqueue_n(&fx.queue, 3);

    let report = fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(report.pending_before, 3);
    assert_eq!(report.processed, 3);
    assert_eq!(report.pending_after, 0);

    let status = fx.daemon.get_recovery_status().await;
    assert_eq!(status.total_succeeded, 3);
    assert_eq!(status.total_failed, 0);
    assert_eq!(status.tracked_retry_files, 0);
    assert_eq!(status.dead_lettered, 0);

    assert!(fx.daemon.stop(Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
async fn force_on_empty_queue_is_noop() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    let report = fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.pending_before, 0);
    assert_eq!(report.pending_after, 0);
    assert_eq!(fx.queue.dead_letter_count(), 0);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn force_fails_when_not_running() {
    let fx = fixture(|_| {}).await;
    let err = fx.daemon.force_recovery_now().await.unwrap_err();
    assert!(err.to_string().contains("not running"));
}

// ============================================================================
// Verification (read-after-write)
// ============================================================================

#[tokio::test]
async fn verification_failure_retains_file() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    // Archive answers 200 but the write never becomes visible.
    fx.mock.durable.store(false, Ordering::SeqCst);
    enqueue_n(&fx.queue, 1);

    let report = fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(report.processed, 1);
    // Retained: neither deleted nor dead-lettered.
    assert_eq!(report.pending_after, 1);
    assert_eq!(fx.queue.dead_letter_count(), 0);

    let status = fx.daemon.get_recovery_status().await;
    assert_eq!(status.total_failed, 1);
    assert_eq!(status.tracked_retry_files, 1);

    // The attempt was logged with its classification.
    assert!(fx
        .sink
        .entries()
        .iter()
        .any(|(sev, _, msg)| *sev == Severity::MediumAlert
            && msg.contains("Attempt 1/3")
            && msg.contains("verification_failure")));

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn verify_timeout_classifies_as_network_timeout() {
    let fx = fixture(|c| c.verify_timeout_secs = 1).await;
    start_paused(&fx).await;

    // Archive succeeds and is durable; only the verification read stalls.
    fx.mock.verify_delay_ms.store(2000, Ordering::SeqCst);
    enqueue_n(&fx.queue, 1);

    let report = fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.pending_after, 1);

    // A slow service is a network problem, not a lost write.
    assert!(fx
        .sink
        .entries()
        .iter()
        .any(|(sev, _, msg)| *sev == Severity::MediumAlert
            && msg.contains("Attempt 1/3")
            && msg.contains("network_timeout")));

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Three strikes and dead-lettering
// ============================================================================

#[tokio::test]
async fn third_failure_dead_letters_by_type() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    fx.mock.archive_status.store(500, Ordering::SeqCst);
    enqueue_n(&fx.queue, 1);

    for _ in 0..2 {
        fx.daemon.force_recovery_now().await.unwrap();
        // Two strikes: still pending, still tracked.
        assert_eq!(fx.queue.count(), 1);
    }
    assert_eq!(fx.daemon.get_recovery_status().await.tracked_retry_files, 1);

    fx.daemon.force_recovery_now().await.unwrap();

    // Third strike: gone from pending, exactly one dead-letter entry, tracker purged.
    assert_eq!(fx.queue.count(), 0);
    let summary = fx.queue.failed_summary();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.by_type.get("server_error"), Some(&1));
    assert_eq!(fx.daemon.get_recovery_status().await.tracked_retry_files, 0);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn corrupt_file_dead_letters_as_data_corruption() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    std::fs::write(fx.queue.pending_dir().join("broken.json"), "{not json").unwrap();
    for _ in 0..3 {
        fx.daemon.force_recovery_now().await.unwrap();
    }

    assert_eq!(fx.queue.count(), 0);
    let summary = fx.queue.failed_summary();
    assert_eq!(summary.by_type.get("data_corruption"), Some(&1));

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn rate_limited_classification_reaches_dead_letter_dir() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    fx.mock.archive_status.store(429, Ordering::SeqCst);
    enqueue_n(&fx.queue, 1);
    for _ in 0..3 {
        fx.daemon.force_recovery_now().await.unwrap();
    }

    assert_eq!(
        fx.queue.failed_summary().by_type.get("rate_limited"),
        Some(&1)
    );

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Health gate and backoff
// ============================================================================

#[tokio::test]
async fn unhealthy_service_skips_cycle_and_backs_off() {
    // Floor of 1s so consecutive probes happen inside test time.
    let fx = fixture(|c| c.backoff_base_secs = 1).await;
    start_paused(&fx).await;

    fx.mock.health_status.store(503, Ordering::SeqCst);
    enqueue_n(&fx.queue, 3);

    // First failing probe: wait stays at the floor, nothing processed.
    fx.daemon.force_recovery_now().await.unwrap();
    let status = fx.daemon.get_recovery_status().await;
    assert_eq!(status.last_health_ok, Some(false));
    assert_eq!(status.backoff_seconds, 1);
    assert_eq!(fx.queue.count(), 3);
    assert_eq!(fx.mock.archive_hits.load(Ordering::SeqCst), 0);

    // Probe again after the window: doubles.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(fx.daemon.get_recovery_status().await.backoff_seconds, 2);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(fx.daemon.get_recovery_status().await.backoff_seconds, 4);

    // All files untouched throughout the outage.
    assert_eq!(fx.queue.count(), 3);

    // One success resets to the floor and drains.
    fx.mock.health_status.store(200, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(4100)).await;
    fx.daemon.force_recovery_now().await.unwrap();
    let status = fx.daemon.get_recovery_status().await;
    assert_eq!(status.last_health_ok, Some(true));
    assert_eq!(status.backoff_seconds, 1);
    assert_eq!(fx.queue.count(), 0);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn backoff_clamps_at_configured_max() {
    let fx = fixture(|c| {
        c.backoff_base_secs = 1;
        c.backoff_max_secs = 2;
    })
    .await;
    start_paused(&fx).await;

    fx.mock.health_status.store(503, Ordering::SeqCst);

    // 1 → 2, then the ceiling holds on further consecutive failures.
    let mut observed = Vec::new();
    for _ in 0..4 {
        fx.daemon.force_recovery_now().await.unwrap();
        observed.push(fx.daemon.get_recovery_status().await.backoff_seconds);
        tokio::time::sleep(Duration::from_millis(
            observed.last().unwrap() * 1000 + 100,
        ))
        .await;
    }
    assert_eq!(observed, vec![1, 2, 2, 2]);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn backoff_within_window_skips_without_probing() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    fx.mock.health_status.store(500, Ordering::SeqCst);
    fx.daemon.force_recovery_now().await.unwrap();
    let probes = fx.mock.health_hits.load(Ordering::SeqCst);

    // Default 30s window: an immediate second cycle must not re-probe.
    fx.daemon.force_recovery_now().await.unwrap();
    assert_eq!(fx.mock.health_hits.load(Ordering::SeqCst), probes);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_twice_is_rejected() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;
    assert!(fx.daemon.start().await.is_err());
    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn scheduled_loop_drains_without_force() {
    let fx = fixture(|c| {
        c.base_interval_secs = 1;
        c.idle_interval_secs = 1;
    })
    .await;
    enqueue_n(&fx.queue, 2);

    fx.daemon.start().await.unwrap();
    // First scheduled cycle runs promptly after start.
    for _ in 0..50 {
        if fx.queue.count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(fx.queue.count(), 0);
    assert!(fx.daemon.stop(Duration::from_secs(5)).await.unwrap());

    let status = fx.daemon.get_recovery_status().await;
    assert!(!status.running);
    assert_eq!(status.total_succeeded, 2);
}

#[tokio::test]
async fn resume_clears_pause() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;
    fx.daemon.resume().await;

    let status = fx.daemon.get_recovery_status().await;
    assert!(status.paused_until.is_none());

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Emergencies
// ============================================================================

#[tokio::test]
async fn backlog_emergency_latches_once() {
    let fx = fixture(|c| c.backlog_threshold = 5).await;
    start_paused(&fx).await;
    enqueue_n(&fx.queue, 6);

    let events = fx.daemon.run_emergency_sweep().await;
    assert!(events
        .iter()
        .any(|e| e.kind == EmergencyKind::BacklogExplosion));

    // Latched: the next sweep stays quiet even though the queue is unchanged.
    let events = fx.daemon.run_emergency_sweep().await;
    assert!(events.is_empty());

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn cascade_emergency_writes_debug_bundle() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    // Four files failing with the same class, three strikes each: 12 failure
    // events, so the last 10 all share server_error.
    fx.mock.archive_status.store(500, Ordering::SeqCst);
    enqueue_n(&fx.queue, 4);
    for _ in 0..3 {
        fx.daemon.force_recovery_now().await.unwrap();
    }

    let events = fx.daemon.run_emergency_sweep().await;
    let cascade = events
        .iter()
        .find(|e| e.kind == EmergencyKind::CascadeFailure)
        .expect("cascade emergency should fire");
    assert!(cascade.message.contains("server_error"));

    // Health was fine, so no automatic pause.
    assert!(fx.daemon.get_recovery_status().await.paused_until.is_none());

    let bundles: Vec<_> = std::fs::read_dir(fx.queue.analytics_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("cascade_")
        })
        .collect();
    assert_eq!(bundles.len(), 1);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn trends_file_written_on_failures() {
    let fx = fixture(|_| {}).await;
    start_paused(&fx).await;

    fx.mock.archive_status.store(503, Ordering::SeqCst);
    enqueue_n(&fx.queue, 1);
    fx.daemon.force_recovery_now().await.unwrap();

    let trends_path = fx.queue.analytics_dir().join("failure_trends.json");
    assert!(trends_path.exists());
    let trends: Value =
        serde_json::from_str(&std::fs::read_to_string(trends_path).unwrap()).unwrap();
    assert_eq!(trends["by_type"]["server_error"]["count"], 1);

    fx.daemon.stop(Duration::from_secs(5)).await.unwrap();
}
