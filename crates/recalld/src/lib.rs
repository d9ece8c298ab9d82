//! Recall recovery daemon.
//!
//! Drains the file-backed pending queue of conversation exchanges that failed
//! to reach the remote long-term memory service, with read-after-write
//! verification, 3-strike dead-lettering, adaptive scheduling, and a monitor
//! that watches for systemic failure patterns and emergency conditions.

pub mod client;
pub mod daemon;
pub mod monitor;
pub mod queue;
pub mod snapshot;
pub mod tracker;

pub use client::{ErrorKind, MemoryServiceClient, ServiceError};
pub use daemon::{DaemonStatus, ForceRecoveryReport, RecoveryDaemon};
pub use monitor::RecoveryMonitor;
pub use queue::{FailedFilesSummary, PendingQueue};
pub use snapshot::SystemSnapshot;
pub use tracker::AttemptTracker;
