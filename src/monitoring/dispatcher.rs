use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::NotifyError;
use super::snapshot::HealthSnapshot;
use super::{AlertCandidate, Severity};

pub const STATS_WINDOW_HOURS: i64 = 24;

/// Transport that delivers a formatted alert to an operator.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Latest delivery attempt for one alert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    SendFailed { reason: String },
    Suppressed { remaining_ms: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
    pub emergency: usize,
    pub by_key: HashMap<String, usize>,
    pub last_alert_at: Option<DateTime<Utc>>,
    /// No critical or emergency alert inside the window.
    pub is_healthy: bool,
}

/// Cooldown-deduplicating alert sender with a last-write-per-key history.
pub struct AlertDispatcher {
    channel: Arc<dyn NotificationChannel>,
    cooldown: Duration,
    history: Mutex<HashMap<String, AlertRecord>>,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, cooldown: Duration) -> Self {
        Self {
            channel,
            cooldown,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn history(&self) -> MutexGuard<'_, HashMap<String, AlertRecord>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub async fn dispatch(&self, candidate: AlertCandidate) -> DispatchOutcome {
        self.dispatch_at(candidate, Utc::now()).await
    }

    /// Deliver `candidate` unless its key was recorded less than one cooldown
    /// before `now`. The history entry is written before sending, so a failed
    /// send still opens a new cooldown window.
    #[instrument(skip(self, candidate), fields(key = ?candidate.key, severity = %candidate.severity))]
    pub async fn dispatch_at(&self, candidate: AlertCandidate, now: DateTime<Utc>) -> DispatchOutcome {
        let message = {
            let mut history = self.history();

            if let Some(key) = &candidate.key {
                if let Some(last) = history.get(key) {
                    let elapsed = now.signed_duration_since(last.timestamp);
                    if elapsed < self.cooldown {
                        let remaining_ms = (self.cooldown - elapsed).num_milliseconds();
                        debug!(remaining_ms, "Alert suppressed by cooldown");
                        return DispatchOutcome::Suppressed { remaining_ms };
                    }
                }
            }

            let key = candidate
                .key
                .clone()
                .unwrap_or_else(|| format!("manual:{}", Uuid::new_v4()));
            let message = format_alert_message(&candidate, now);
            history.insert(
                key.clone(),
                AlertRecord {
                    key,
                    timestamp: now,
                    title: candidate.title.clone(),
                    message: message.clone(),
                    severity: candidate.severity,
                },
            );
            message
        };

        match candidate.severity {
            Severity::Critical | Severity::Emergency => {
                error!("{} ALERT: {}", candidate.severity, candidate.title)
            }
            Severity::Warning => warn!("WARNING ALERT: {}", candidate.title),
            Severity::Info => info!("INFO ALERT: {}", candidate.title),
        }

        match self.channel.send(&message).await {
            Ok(()) => DispatchOutcome::Sent,
            Err(e) => {
                error!(channel = self.channel.name(), "Failed to deliver alert: {}", e);
                DispatchOutcome::SendFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// All records, newest first.
    pub fn alert_history(&self) -> Vec<AlertRecord> {
        let mut records: Vec<_> = self.history().values().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alert_stats_at(Utc::now())
    }

    pub fn alert_stats_at(&self, now: DateTime<Utc>) -> AlertStats {
        let cutoff = now - Duration::hours(STATS_WINDOW_HOURS);
        let history = self.history();
        let mut stats = AlertStats::default();

        for record in history.values().filter(|r| r.timestamp > cutoff) {
            stats.total += 1;
            match record.severity {
                Severity::Info => stats.info += 1,
                Severity::Warning => stats.warning += 1,
                Severity::Critical => stats.critical += 1,
                Severity::Emergency => stats.emergency += 1,
            }
            *stats.by_key.entry(record.key.clone()).or_default() += 1;
            stats.last_alert_at = stats.last_alert_at.max(Some(record.timestamp));
        }

        stats.is_healthy = stats.critical == 0 && stats.emergency == 0;
        stats
    }

    /// Drop records older than `max_age`. Returns how many were removed.
    pub fn prune_history(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            warn!("Alert history retention exceeds the representable time range; nothing pruned");
            return 0;
        };
        let mut history = self.history();
        let before = history.len();
        history.retain(|_, record| record.timestamp > cutoff);
        let removed = before - history.len();

        if removed > 0 {
            info!("Cleaned up {} old alerts from history", removed);
        }
        removed
    }
}

pub fn format_alert_message(candidate: &AlertCandidate, now: DateTime<Utc>) -> String {
    let (icon, call_out) = match candidate.severity {
        Severity::Info => ("ℹ️", "Review when convenient."),
        Severity::Warning => ("⚠️", "Review when convenient."),
        Severity::Critical => ("🚨", "Immediate action required!"),
        Severity::Emergency => ("🆘", "Immediate action required!"),
    };

    format!(
        "{icon} [{label}] {title}\n\n{detail}\n\nTime: {time}\n{call_out}",
        label = candidate.severity.label(),
        title = candidate.title,
        detail = candidate.detail,
        time = now.to_rfc3339(),
    )
}

/// Advisory notes derived from memory pressure and recent alert volume, most
/// urgent first.
pub fn recommendations(snapshot: &HealthSnapshot, stats: &AlertStats) -> Vec<String> {
    let mut notes = Vec::new();

    let memory_pct = snapshot.memory.percentage_of_capacity;
    if memory_pct >= 90.0 {
        notes.push(format!(
            "Memory is at {memory_pct:.1}% of capacity: restart the service or raise the capacity baseline"
        ));
    } else if memory_pct >= 75.0 {
        notes.push(format!(
            "Memory is at {memory_pct:.1}% of capacity: look for leaks or oversized caches"
        ));
    }

    if stats.critical + stats.emergency > 0 {
        notes.push(format!(
            "{} critical alert(s) in the last {STATS_WINDOW_HOURS} hours: investigate before they recur",
            stats.critical + stats.emergency
        ));
    }

    if stats.total >= 20 {
        notes.push(format!(
            "{} alerts in the last {STATS_WINDOW_HOURS} hours: review thresholds and recurring failures",
            stats.total
        ));
    } else if stats.total >= 5 {
        notes.push(format!(
            "{} alerts in the last {STATS_WINDOW_HOURS} hours: check the alert history for patterns",
            stats.total
        ));
    }

    if notes.is_empty() {
        notes.push("System is operating normally".to_string());
    }
    notes
}
