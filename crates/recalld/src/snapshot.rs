//! System state snapshots for failure analysis.
//!
//! Collected at each failure and kept in a short bounded history by the
//! monitor. Introspection problems degrade to an error-marked snapshot;
//! they never propagate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use sysinfo::{Disks, Pid, System};

/// Point-in-time view of the daemon's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Daemon process RSS in MB.
    pub memory_usage_mb: u64,
    /// Free space on the disk holding the backup root, in GB.
    pub disk_free_gb: u64,
    /// Last observed memory-service latency, if any.
    pub service_latency_ms: Option<u64>,
    /// Pending queue depth at collection time.
    pub pending_count: usize,
    /// Global CPU utilization percent.
    pub cpu_percent: f32,
    /// Daemon disk I/O rate since the previous snapshot, MB/s.
    pub disk_io_mb_s: f64,
    /// Set when introspection failed and the numeric fields are unreliable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SystemSnapshot {
    /// Placeholder snapshot when introspection is unavailable.
    pub fn degraded(pending_count: usize, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            memory_usage_mb: 0,
            disk_free_gb: 0,
            service_latency_ms: None,
            pending_count,
            cpu_percent: 0.0,
            disk_io_mb_s: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Stateful collector; keeps sysinfo handles and the previous collection
/// instant so disk I/O can be expressed as a rate.
pub struct SnapshotCollector {
    system: System,
    disks: Disks,
    last_collect: Option<Instant>,
}

impl SnapshotCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            last_collect: None,
        }
    }

    /// Collect a snapshot. `service_latency_ms` is the caller's last health
    /// or archive round-trip, when one has been observed.
    pub fn collect(
        &mut self,
        backup_root: &Path,
        pending_count: usize,
        service_latency_ms: Option<u64>,
    ) -> SystemSnapshot {
        self.system.refresh_memory();
        self.system.refresh_cpu();
        self.system.refresh_processes();
        self.disks.refresh();

        let pid = Pid::from_u32(std::process::id());
        let Some(process) = self.system.process(pid) else {
            return SystemSnapshot::degraded(pending_count, "own process not visible to sysinfo");
        };

        let memory_usage_mb = process.memory() / (1024 * 1024);

        let elapsed = self
            .last_collect
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.last_collect = Some(Instant::now());

        let io = process.disk_usage();
        let disk_io_mb_s = if elapsed > 0.0 {
            (io.read_bytes + io.written_bytes) as f64 / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        };

        SystemSnapshot {
            timestamp: Utc::now(),
            memory_usage_mb,
            disk_free_gb: self.free_space_gb(backup_root),
            service_latency_ms,
            pending_count,
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            disk_io_mb_s,
            error: None,
        }
    }

    /// Free space on the disk whose mount point contains `path` (longest
    /// prefix wins); falls back to the minimum across disks.
    fn free_space_gb(&self, path: &Path) -> u64 {
        let mut best: Option<(usize, u64)> = None;
        for disk in self.disks.list() {
            let mount = disk.mount_point();
            if path.starts_with(mount) {
                let depth = mount.components().count();
                if best.map(|(d, _)| depth >= d).unwrap_or(true) {
                    best = Some((depth, disk.available_space()));
                }
            }
        }
        let bytes = best.map(|(_, space)| space).or_else(|| {
            self.disks
                .list()
                .iter()
                .map(|d| d.available_space())
                .min()
        });
        bytes.unwrap_or(0) / (1024 * 1024 * 1024)
    }
}

impl Default for SnapshotCollector {
    fn default() -> Self {
        Self::new()
    }
}
