//! Shared contracts for the recall recovery subsystem.
//!
//! Holds the data model for buffered conversation exchanges, the
//! severity-leveled log sink used by the daemon and monitor, and the
//! recovery configuration. Consumed by `recalld` and by the backup
//! writer that produces pending files.

pub mod config;
pub mod exchange;
pub mod logsink;

pub use config::RecoveryConfig;
pub use exchange::PendingExchange;
pub use logsink::{LogSink, MemorySink, Severity, TracingSink};
