//! Severity-leveled log routing.
//!
//! Every operator-visible message from the daemon and monitor goes through an
//! injected [`LogSink`] so the hosting application can surface degradations on
//! its own dashboard. When nothing is injected, [`TracingSink`] routes to the
//! local `tracing` subscriber.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Message severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Diagnostic detail, normally invisible.
    LowDebug,
    /// Noteworthy but self-correcting condition.
    MediumAlert,
    /// Degraded operation an operator should look at.
    HighDegrade,
    /// Subsystem stopped or about to stop.
    CriticalStop,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowDebug => "LOW_DEBUG",
            Self::MediumAlert => "MEDIUM_ALERT",
            Self::HighDegrade => "HIGH_DEGRADE",
            Self::CriticalStop => "CRITICAL_STOP",
        }
    }
}

/// Destination for severity-leveled messages.
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, component: &str, message: &str);
}

/// Default sink: route to the local `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, severity: Severity, component: &str, message: &str) {
        match severity {
            Severity::LowDebug => tracing::debug!(component, "{}", message),
            Severity::MediumAlert => tracing::warn!(component, "{}", message),
            Severity::HighDegrade => tracing::error!(component, "{}", message),
            Severity::CriticalStop => tracing::error!(component, "CRITICAL: {}", message),
        }
    }
}

/// In-memory sink for tests: records every message it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Severity, String, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded entries, oldest first.
    pub fn entries(&self) -> Vec<(Severity, String, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// Count of entries at the given severity.
    pub fn count_at(&self, severity: Severity) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == severity)
            .count()
    }
}

impl LogSink for MemorySink {
    fn log(&self, severity: Severity, component: &str, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((severity, component.to_string(), message.to_string()));
    }
}
