//! Durable failure-trend analytics.
//!
//! Load-modify-save of `analytics/failure_trends.json`: per-type counters and
//! date ranges, a capped insight log, and recomputed hotspots. Persistence
//! problems are logged and swallowed — analytics never block recovery.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use super::FailurePattern;

/// Insight entries kept in the log.
const MAX_INSIGHTS: usize = 200;
/// Distinct conversations remembered per error type.
const MAX_CONVERSATIONS: usize = 50;
/// Recent occurrence timestamps kept per error type.
const MAX_RECENT: usize = 10;
/// Failures of one type before it becomes a hotspot.
const HOTSPOT_COUNT: usize = 10;
/// Of the last 10 occurrences, more than this many within one day is a spike.
const SPIKE_COUNT: usize = 5;

/// Rolling stats for one error type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeTrend {
    pub count: usize,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Distinct conversations touched by this failure type.
    #[serde(default)]
    pub conversations: Vec<String>,
    /// Timestamps of the most recent occurrences.
    #[serde(default)]
    pub recent: Vec<DateTime<Utc>>,
}

/// One recorded insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightEntry {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub insight: String,
}

/// A failure type that crossed the hotspot threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub count: usize,
    pub recent_spike: bool,
}

/// Serialized shape of `failure_trends.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureTrends {
    #[serde(default)]
    pub by_type: BTreeMap<String, TypeTrend>,
    #[serde(default)]
    pub insights: Vec<InsightEntry>,
    #[serde(default)]
    pub hotspots: BTreeMap<String, Hotspot>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FailureTrends {
    /// Short human summary for status output.
    pub fn summary(&self) -> String {
        let total: usize = self.by_type.values().map(|t| t.count).sum();
        if total == 0 {
            return "no failures recorded".to_string();
        }
        let top = self
            .by_type
            .iter()
            .max_by_key(|(_, t)| t.count)
            .map(|(kind, t)| format!("{} ({})", kind, t.count))
            .unwrap_or_default();
        format!(
            "{} failures across {} types, {} hotspot(s), most frequent: {}",
            total,
            self.by_type.len(),
            self.hotspots.len(),
            top
        )
    }
}

/// Owner of the trends file.
pub struct TrendStore {
    path: PathBuf,
}

impl TrendStore {
    pub fn new(analytics_dir: PathBuf) -> Self {
        Self {
            path: analytics_dir.join("failure_trends.json"),
        }
    }

    /// Record one failure and any insights it produced. Never fails the
    /// caller; IO problems are logged at warn.
    pub fn record(&self, pattern: &FailurePattern, insights: &[String]) -> FailureTrends {
        let mut trends = self.load();
        let key = pattern.error_kind.as_str().to_string();

        let entry = trends.by_type.entry(key.clone()).or_default();
        entry.count += 1;
        entry.first_seen.get_or_insert(pattern.timestamp);
        entry.last_seen = Some(pattern.timestamp);
        if let Some(conv) = &pattern.conversation_id {
            if !entry.conversations.contains(conv) {
                entry.conversations.push(conv.clone());
                if entry.conversations.len() > MAX_CONVERSATIONS {
                    entry.conversations.remove(0);
                }
            }
        }
        entry.recent.push(pattern.timestamp);
        if entry.recent.len() > MAX_RECENT {
            let excess = entry.recent.len() - MAX_RECENT;
            entry.recent.drain(0..excess);
        }

        for insight in insights {
            trends.insights.push(InsightEntry {
                timestamp: pattern.timestamp,
                error_type: key.clone(),
                insight: insight.clone(),
            });
        }
        if trends.insights.len() > MAX_INSIGHTS {
            let excess = trends.insights.len() - MAX_INSIGHTS;
            trends.insights.drain(0..excess);
        }

        Self::recompute_hotspots(&mut trends);
        trends.updated_at = Some(Utc::now());

        if let Err(e) = self.save(&trends) {
            warn!("Failed to persist failure trends: {}", e);
        }
        trends
    }

    /// Hotspot: any type past 10 failures; spiking when more than 5 of its
    /// last 10 occurrences landed within the past day.
    fn recompute_hotspots(trends: &mut FailureTrends) {
        let day_ago = Utc::now() - chrono::Duration::days(1);
        trends.hotspots = trends
            .by_type
            .iter()
            .filter(|(_, t)| t.count > HOTSPOT_COUNT)
            .map(|(kind, t)| {
                let within_day = t.recent.iter().filter(|ts| **ts >= day_ago).count();
                (
                    kind.clone(),
                    Hotspot {
                        count: t.count,
                        recent_spike: within_day > SPIKE_COUNT,
                    },
                )
            })
            .collect();
    }

    pub fn load(&self) -> FailureTrends {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Corrupt failure trends file, starting fresh: {}", e);
                FailureTrends::default()
            }),
            Err(_) => FailureTrends::default(),
        }
    }

    fn save(&self, trends: &FailureTrends) -> Result<()> {
        let json = serde_json::to_string_pretty(trends)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Derive operator recommendations from insight wording, highest priority
/// first: cascade > memory > periodic > spike.
pub fn recommendations(insights: &[InsightEntry], hotspots: &BTreeMap<String, Hotspot>) -> Vec<String> {
    let mut recs = Vec::new();
    let text: Vec<&str> = insights.iter().map(|i| i.insight.as_str()).collect();

    if text.iter().any(|s| s.contains("cascade")) {
        recs.push(
            "Cascade risk detected: check remote memory service health before resuming writes"
                .to_string(),
        );
    }
    if text.iter().any(|s| s.contains("memory")) {
        recs.push("Failures correlate with memory pressure: shrink sibling buffers or raise limits".to_string());
    }
    if text.iter().any(|s| s.contains("periodic")) {
        recs.push("Periodic failure pattern: correlate with scheduled jobs (backups, cron) at that time".to_string());
    }
    if text.iter().any(|s| s.contains("large payload")) {
        recs.push("Large payloads failing: consider chunking oversized exchanges before archiving".to_string());
    }
    if hotspots.values().any(|h| h.recent_spike) {
        recs.push("Recent failure spike: review the newest dead-letter entries for a common cause".to_string());
    }
    recs
}
