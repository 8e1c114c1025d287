//! Usage-pattern analysis over the historical request log.
//!
//! The analyzer is a pure read-only view: it counts requests per backend over
//! the analysis window, recommends the busiest backend when the sample is
//! large enough, and reports its share of traffic as the confidence. The only
//! cached state is the last-analyzed timestamp, kept for observability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// Minimum traffic share a recommendation needs before a switch is considered.
pub const MIN_CONFIDENCE: f64 = 0.6;

/// Upper bound on history rows pulled per analysis.
const SCAN_LIMIT: usize = 10_000;

/// One row of the historical request log.
///
/// The log is written by the (external) API layer; timestamps arrive either
/// as RFC 3339 strings, naive datetime strings, or epoch numbers, and all are
/// accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryEntry {
    pub backend: String,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
}

fn flexible_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Epoch(n) => {
            // Heuristic: values this large are epoch milliseconds.
            let timestamp = if n > 10_000_000_000 {
                Utc.timestamp_millis_opt(n)
            } else {
                Utc.timestamp_opt(n, 0)
            };
            timestamp
                .single()
                .ok_or_else(|| serde::de::Error::custom(format!("epoch out of range: {n}")))
        }
        Raw::Text(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(&s) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Utc.from_utc_datetime(&naive))
                .map_err(|e| serde::de::Error::custom(format!("bad timestamp {s:?}: {e}")))
        }
    }
}

/// Read-only access to the historical request log.
#[async_trait]
pub trait RequestHistory: Send + Sync {
    /// The most recent entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// In-memory request history for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryHistory {
    entries: parking_lot::RwLock<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, backend: impl Into<String>, created_at: DateTime<Utc>) {
        self.entries.write().push(HistoryEntry {
            backend: backend.into(),
            created_at,
        });
    }
}

#[async_trait]
impl RequestHistory for InMemoryHistory {
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.entries.read().clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// One analysis pass over the window.
#[derive(Debug, Clone, Serialize)]
pub struct UsageAnalysis {
    pub total_requests: u64,
    /// Per-backend counts over the full window.
    pub counts: HashMap<String, u64>,
    /// Per-backend counts over the last 24 hours.
    pub recent_counts: HashMap<String, u64>,
    /// Percentage share per backend.
    pub shares: HashMap<String, f64>,
    pub recommended: Option<String>,
    /// Traffic share of the recommended backend, in [0, 1].
    pub confidence: f64,
    pub reason: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Analyzes request patterns to decide which backend deserves the GPU.
pub struct PatternAnalyzer {
    history: Arc<dyn RequestHistory>,
    window_days: u32,
    min_requests: u64,
    last_analyzed: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

impl PatternAnalyzer {
    pub fn new(history: Arc<dyn RequestHistory>, window_days: u32, min_requests: u64) -> Self {
        Self {
            history,
            window_days,
            min_requests,
            last_analyzed: parking_lot::RwLock::new(None),
        }
    }

    pub fn last_analyzed(&self) -> Option<DateTime<Utc>> {
        *self.last_analyzed.read()
    }

    /// Count usage over the window and produce a recommendation when the
    /// busiest backend clears the minimum sample size.
    pub async fn analyze(&self) -> Result<UsageAnalysis> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::days(i64::from(self.window_days));
        let recent_cutoff = now - chrono::Duration::hours(24);

        let entries = self.history.recent(SCAN_LIMIT).await?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut recent_counts: HashMap<String, u64> = HashMap::new();
        for entry in entries {
            if entry.created_at < window_start {
                continue;
            }
            *counts.entry(entry.backend.clone()).or_default() += 1;
            if entry.created_at >= recent_cutoff {
                *recent_counts.entry(entry.backend).or_default() += 1;
            }
        }

        let total_requests: u64 = counts.values().sum();
        *self.last_analyzed.write() = Some(now);

        if total_requests == 0 {
            return Ok(UsageAnalysis {
                total_requests: 0,
                counts,
                recent_counts,
                shares: HashMap::new(),
                recommended: None,
                confidence: 0.0,
                reason: "no requests in analysis window".to_string(),
                analyzed_at: now,
            });
        }

        let shares: HashMap<String, f64> = counts
            .iter()
            .map(|(backend, count)| {
                (
                    backend.clone(),
                    (*count as f64 / total_requests as f64) * 100.0,
                )
            })
            .collect();

        // Busiest backend; name breaks ties deterministically.
        let (busiest, busiest_count) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(backend, count)| (backend.clone(), *count))
            .unwrap_or_default();

        if busiest_count < self.min_requests {
            return Ok(UsageAnalysis {
                total_requests,
                counts,
                recent_counts,
                shares,
                recommended: None,
                confidence: 0.0,
                reason: format!(
                    "insufficient requests ({busiest_count} < {})",
                    self.min_requests
                ),
                analyzed_at: now,
            });
        }

        let share = shares.get(&busiest).copied().unwrap_or(0.0);
        Ok(UsageAnalysis {
            total_requests,
            counts,
            recent_counts,
            shares,
            confidence: share / 100.0,
            reason: format!(
                "{busiest} received {share:.1}% of requests over the last {} days",
                self.window_days
            ),
            recommended: Some(busiest),
            analyzed_at: now,
        })
    }

    /// The backend to switch to, iff it differs from `current` and its share
    /// clears the confidence threshold.
    pub async fn should_switch(&self, current: Option<&str>) -> Result<Option<String>> {
        let analysis = self.analyze().await?;

        let Some(recommended) = analysis.recommended else {
            return Ok(None);
        };
        if current == Some(recommended.as_str()) {
            return Ok(None);
        }
        if analysis.confidence < MIN_CONFIDENCE {
            tracing::debug!(
                recommended = %recommended,
                confidence = analysis.confidence,
                "confidence too low for switch"
            );
            return Ok(None);
        }

        tracing::info!(
            current = ?current,
            recommended = %recommended,
            confidence = analysis.confidence,
            "recommending backend switch"
        );
        Ok(Some(recommended))
    }
}
