use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::monitoring::error::MonitorError;
use crate::monitoring::recorder::RecorderSettings;
use crate::monitoring::window::RetentionPolicy;

const ENV_PREFIX: &str = "OPSWATCH";

/// Longest cooldown or retention window accepted by `validate`.
const MAX_WINDOW_DAYS: i64 = 3650;

fn max_window() -> chrono::Duration {
    chrono::Duration::days(MAX_WINDOW_DAYS)
}

/// Convert a configured span to a `chrono::Duration`, `None` when it does not
/// fit in one.
fn span(value: u64, unit: fn(i64) -> Option<chrono::Duration>) -> Option<chrono::Duration> {
    i64::try_from(value).ok().and_then(unit)
}

fn span_ms(value: u64) -> Option<chrono::Duration> {
    span(value, chrono::Duration::try_milliseconds)
}

fn span_secs(value: u64) -> Option<chrono::Duration> {
    span(value, chrono::Duration::try_seconds)
}

fn span_hours(value: u64) -> Option<chrono::Duration> {
    span(value, chrono::Duration::try_hours)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Per-metric warning/critical levels
    pub thresholds: ThresholdConfig,

    /// Alert deduplication settings
    pub alerting: AlertingConfig,

    /// Memory capacity baseline used for percentages
    pub memory: MemoryConfig,

    /// Periodic cadences
    pub schedule: ScheduleConfig,

    /// Dependency probe endpoints and timeouts
    pub probes: ProbeConfig,

    /// Notification channel settings
    pub notifications: NotificationConfig,

    /// Bucket and slow-query retention
    pub retention: RetentionConfig,
}

/// Recognized threshold metrics. Anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Memory,
    Cpu,
    ResponseTime,
    ErrorRate,
    DiskSpace,
    DependencyLatency,
    DependencyStaleness,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::Memory,
        MetricKind::Cpu,
        MetricKind::ResponseTime,
        MetricKind::ErrorRate,
        MetricKind::DiskSpace,
        MetricKind::DependencyLatency,
        MetricKind::DependencyStaleness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Memory => "memory",
            MetricKind::Cpu => "cpu",
            MetricKind::ResponseTime => "response_time",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::DiskSpace => "disk_space",
            MetricKind::DependencyLatency => "dependency_latency",
            MetricKind::DependencyStaleness => "dependency_staleness",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::Memory => "MB",
            MetricKind::Cpu | MetricKind::ErrorRate | MetricKind::DiskSpace => "%",
            MetricKind::ResponseTime | MetricKind::DependencyLatency => "ms",
            MetricKind::DependencyStaleness => "s",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "memory" => Ok(MetricKind::Memory),
            "cpu" => Ok(MetricKind::Cpu),
            "response_time" | "responsetime" => Ok(MetricKind::ResponseTime),
            "error_rate" | "errorrate" => Ok(MetricKind::ErrorRate),
            "disk_space" | "diskspace" => Ok(MetricKind::DiskSpace),
            "dependency_latency" => Ok(MetricKind::DependencyLatency),
            "dependency_staleness" => Ok(MetricKind::DependencyStaleness),
            _ => Err(MonitorError::UnknownMetric(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdLevels {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdLevels {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdConfig {
    /// Resident memory in MB
    pub memory: ThresholdLevels,

    /// Process CPU usage percentage
    pub cpu: ThresholdLevels,

    /// Average response time in milliseconds
    pub response_time: ThresholdLevels,

    /// Error rate percentage
    pub error_rate: ThresholdLevels,

    /// Fullest disk usage percentage
    pub disk_space: ThresholdLevels,

    /// Dependency RPC latency in milliseconds
    pub dependency_latency: ThresholdLevels,

    /// Seconds since the dependency last produced an event
    pub dependency_staleness: ThresholdLevels,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            memory: ThresholdLevels::new(1200.0, 1500.0),
            cpu: ThresholdLevels::new(70.0, 90.0),
            response_time: ThresholdLevels::new(1000.0, 3000.0),
            error_rate: ThresholdLevels::new(5.0, 10.0),
            disk_space: ThresholdLevels::new(80.0, 90.0),
            dependency_latency: ThresholdLevels::new(2000.0, 5000.0),
            dependency_staleness: ThresholdLevels::new(300.0, 900.0),
        }
    }
}

impl ThresholdConfig {
    pub fn get(&self, kind: MetricKind) -> ThresholdLevels {
        match kind {
            MetricKind::Memory => self.memory,
            MetricKind::Cpu => self.cpu,
            MetricKind::ResponseTime => self.response_time,
            MetricKind::ErrorRate => self.error_rate,
            MetricKind::DiskSpace => self.disk_space,
            MetricKind::DependencyLatency => self.dependency_latency,
            MetricKind::DependencyStaleness => self.dependency_staleness,
        }
    }

    fn slot(&mut self, kind: MetricKind) -> &mut ThresholdLevels {
        match kind {
            MetricKind::Memory => &mut self.memory,
            MetricKind::Cpu => &mut self.cpu,
            MetricKind::ResponseTime => &mut self.response_time,
            MetricKind::ErrorRate => &mut self.error_rate,
            MetricKind::DiskSpace => &mut self.disk_space,
            MetricKind::DependencyLatency => &mut self.dependency_latency,
            MetricKind::DependencyStaleness => &mut self.dependency_staleness,
        }
    }

    /// Replace the levels for one metric, rejecting inverted or non-finite levels.
    pub fn set(
        &mut self,
        kind: MetricKind,
        levels: ThresholdLevels,
    ) -> std::result::Result<(), MonitorError> {
        Self::check(kind, levels)?;
        *self.slot(kind) = levels;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), MonitorError> {
        MetricKind::ALL
            .iter()
            .try_for_each(|kind| Self::check(*kind, self.get(*kind)))
    }

    fn check(kind: MetricKind, levels: ThresholdLevels) -> std::result::Result<(), MonitorError> {
        let finite = levels.warning.is_finite() && levels.critical.is_finite();
        if !finite || levels.warning < 0.0 || levels.warning >= levels.critical {
            return Err(MonitorError::InvalidThreshold {
                metric: kind.to_string(),
                warning: levels.warning,
                critical: levels.critical,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertingConfig {
    /// Minimum time between two deliveries of the same alert key
    pub cooldown_ms: u64,

    /// Alert records older than this are dropped on cleanup
    pub history_retention_hours: u32,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 300_000, // 5 minutes
            history_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Reference memory budget for percentage reporting
    pub capacity_baseline_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_baseline_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub health_check_interval_secs: u64,
    pub rotation_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            rotation_interval_secs: 60,
            cleanup_interval_secs: 3600,
        }
    }
}

impl ScheduleConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// PostgreSQL URL pinged on every health check, if set
    pub database_url: Option<String>,

    pub database_timeout_secs: u64,

    /// JSON endpoint reporting dependency status, if set
    pub dependency_status_url: Option<String>,

    pub dependency_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_timeout_secs: 5,
            dependency_status_url: None,
            dependency_timeout_secs: 10,
        }
    }
}

impl ProbeConfig {
    pub fn database_timeout(&self) -> Duration {
        Duration::from_secs(self.database_timeout_secs)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    /// Webhook receiving `{"text": ...}` posts; alerts go to the log when unset
    pub webhook_url: Option<String>,

    pub webhook_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub minute_retention_secs: u64,
    pub hour_retention_secs: u64,
    pub slow_query_threshold_ms: u64,
    pub slow_query_capacity: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute_retention_secs: 3600,
            hour_retention_secs: 86_400,
            slow_query_threshold_ms: 100,
            slow_query_capacity: 100,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file. Unknown keys are an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MonitorConfig = toml::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, optionally layered on
    /// top of the file named by `OPSWATCH_CONFIG`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let mut config = match env::var(format!("{ENV_PREFIX}_CONFIG")) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => MonitorConfig::default(),
        };

        if let Some(cooldown) = parse_env("COOLDOWN_MS")? {
            config.alerting.cooldown_ms = cooldown;
        }
        if let Some(hours) = parse_env("ALERT_HISTORY_HOURS")? {
            config.alerting.history_retention_hours = hours;
        }
        if let Some(bytes) = parse_env("CAPACITY_BASELINE_BYTES")? {
            config.memory.capacity_baseline_bytes = bytes;
        }

        // Cadences
        if let Some(secs) = parse_env("HEALTH_CHECK_SECS")? {
            config.schedule.health_check_interval_secs = secs;
        }
        if let Some(secs) = parse_env("ROTATION_SECS")? {
            config.schedule.rotation_interval_secs = secs;
        }
        if let Some(secs) = parse_env("CLEANUP_SECS")? {
            config.schedule.cleanup_interval_secs = secs;
        }

        // Probes; DATABASE_URL follows the usual convention
        if let Ok(url) = env::var("DATABASE_URL") {
            config.probes.database_url = Some(url);
        }
        if let Ok(url) = env::var(format!("{ENV_PREFIX}_DEPENDENCY_STATUS_URL")) {
            config.probes.dependency_status_url = Some(url);
        }
        if let Some(secs) = parse_env("DATABASE_TIMEOUT_SECS")? {
            config.probes.database_timeout_secs = secs;
        }
        if let Some(secs) = parse_env("DEPENDENCY_TIMEOUT_SECS")? {
            config.probes.dependency_timeout_secs = secs;
        }

        if let Ok(url) = env::var(format!("{ENV_PREFIX}_WEBHOOK_URL")) {
            config.notifications.webhook_url = Some(url);
        }

        // Thresholds: OPSWATCH_THRESHOLD_<METRIC>_WARNING / _CRITICAL
        for kind in MetricKind::ALL {
            let mut levels = config.thresholds.get(kind);
            let metric = kind.as_str().to_ascii_uppercase();
            if let Some(warning) = parse_env(&format!("THRESHOLD_{metric}_WARNING"))? {
                levels.warning = warning;
            }
            if let Some(critical) = parse_env(&format!("THRESHOLD_{metric}_CRITICAL"))? {
                levels.critical = critical;
            }
            config
                .thresholds
                .set(kind, levels)
                .map_err(|e| anyhow::anyhow!("Invalid threshold environment: {e}"))?;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        if self.memory.capacity_baseline_bytes == 0 {
            return Err(anyhow::anyhow!("Memory capacity baseline must be greater than 0"));
        }

        let cadences = [
            ("health check", self.schedule.health_check_interval_secs),
            ("rotation", self.schedule.rotation_interval_secs),
            ("cleanup", self.schedule.cleanup_interval_secs),
        ];
        for (name, secs) in cadences {
            if secs == 0 {
                return Err(anyhow::anyhow!("The {name} interval must be greater than 0"));
            }
        }

        if self.probes.database_timeout_secs == 0 || self.probes.dependency_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Probe timeouts must be greater than 0"));
        }

        if self.retention.minute_retention_secs < self.schedule.rotation_interval_secs {
            return Err(anyhow::anyhow!(
                "Minute retention must cover at least one rotation interval"
            ));
        }

        if self.retention.slow_query_capacity == 0 {
            return Err(anyhow::anyhow!("Slow query capacity must be greater than 0"));
        }

        let windows = [
            ("alerting.cooldown_ms", span_ms(self.alerting.cooldown_ms)),
            (
                "alerting.history_retention_hours",
                span_hours(u64::from(self.alerting.history_retention_hours)),
            ),
            (
                "retention.minute_retention_secs",
                span_secs(self.retention.minute_retention_secs),
            ),
            (
                "retention.hour_retention_secs",
                span_secs(self.retention.hour_retention_secs),
            ),
        ];
        for (name, window) in windows {
            match window {
                Some(window) if window <= max_window() => {}
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid {name}: must not exceed {MAX_WINDOW_DAYS} days"
                    ))
                }
            }
        }

        Ok(())
    }

    pub fn cooldown(&self) -> chrono::Duration {
        span_ms(self.alerting.cooldown_ms)
            .map_or_else(max_window, |d| d.min(max_window()))
    }

    pub fn history_retention(&self) -> chrono::Duration {
        span_hours(u64::from(self.alerting.history_retention_hours))
            .map_or_else(max_window, |d| d.min(max_window()))
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            slow_query_threshold_ms: self.retention.slow_query_threshold_ms as f64,
            slow_query_capacity: self.retention.slow_query_capacity,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        let clamp = |secs: u64| span_secs(secs).map_or_else(max_window, |d| d.min(max_window()));
        let minute_retention = clamp(self.retention.minute_retention_secs);
        let per_window = (self.retention.minute_retention_secs
            / self.schedule.rotation_interval_secs.max(1)) as usize;
        RetentionPolicy {
            minute_retention,
            hour_retention: clamp(self.retention.hour_retention_secs),
            max_minute_buckets: per_window.saturating_mul(2).max(1),
            ..RetentionPolicy::default()
        }
    }
}

fn parse_env<T>(suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let name = format!("{ENV_PREFIX}_{suffix}");
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}
