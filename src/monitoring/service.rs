use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::channels::{LogChannel, WebhookChannel};
use super::dispatcher::{
    recommendations, AlertDispatcher, AlertRecord, AlertStats, DispatchOutcome,
    NotificationChannel,
};
use super::error::{MonitorError, Result};
use super::evaluator::{EvaluationInput, ReleaseHint, ThresholdEvaluator};
use super::exporter::MetricsExporter;
use super::probes::{
    run_with_timeout, DatabaseProbe, DependencyProbe, HttpDependencyProbe, PostgresProbe,
};
use super::recorder::{MetricsRecorder, RequestTimer};
use super::snapshot::{DetailedMetrics, HealthSnapshot, HealthSnapshotBuilder, SysinfoFacts, SystemFacts};
use super::window::{CleanupReport, IntervalBucket, WindowAggregator};
use super::{AlertCandidate, HealthStatus, Severity};
use crate::config::{MetricKind, MonitorConfig, ThresholdConfig, ThresholdLevels};

/// Memory share of the capacity baseline at which the system reports degraded.
const DEGRADED_MEMORY_PERCENT: f64 = 75.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub alerts: AlertStats,
    pub system: HealthSnapshot,
    pub recommendations: Vec<String>,
}

/// The monitoring engine. Built once at startup and shared as
/// `Arc<MonitoringService>` with instrumented call sites and the scheduler.
pub struct MonitoringService {
    recorder: Arc<MetricsRecorder>,
    window: WindowAggregator,
    snapshots: HealthSnapshotBuilder,
    thresholds: RwLock<ThresholdConfig>,
    evaluator: ThresholdEvaluator,
    dispatcher: AlertDispatcher,
    exporter: MetricsExporter,
    database: Option<Arc<dyn DatabaseProbe>>,
    dependency: Option<Arc<dyn DependencyProbe>>,
    database_timeout: Duration,
    dependency_timeout: Duration,
    history_retention: chrono::Duration,
}

impl MonitoringService {
    pub fn builder(config: MonitorConfig) -> MonitoringServiceBuilder {
        MonitoringServiceBuilder::new(config)
    }

    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    pub fn record_request(&self, latency_ms: Option<f64>) {
        self.recorder.record_request(latency_ms);
    }

    pub fn record_error(&self) {
        self.recorder.record_error();
    }

    pub fn record_db_query(&self, elapsed_ms: f64, query: &str) {
        self.recorder.record_db_query(elapsed_ms, query);
    }

    pub fn record_cache_hit(&self) {
        self.recorder.record_cache_hit();
    }

    pub fn record_cache_miss(&self) {
        self.recorder.record_cache_miss();
    }

    /// Times the caller's scope as one request.
    pub fn start_request(&self) -> RequestTimer {
        RequestTimer::new(Arc::clone(&self.recorder))
    }

    pub fn snapshot(&self) -> Result<HealthSnapshot> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Result<HealthSnapshot> {
        self.snapshots.build(&self.recorder, &self.window, now)
    }

    pub fn detailed_metrics(&self) -> Result<DetailedMetrics> {
        self.snapshots
            .build_detailed(&self.recorder, &self.window, Utc::now())
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        self.thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes effect on the next health check.
    pub fn set_threshold(&self, kind: MetricKind, levels: ThresholdLevels) -> Result<()> {
        self.thresholds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(kind, levels)?;
        info!(metric = %kind, warning = levels.warning, critical = levels.critical, "Threshold updated");
        Ok(())
    }

    pub async fn run_health_check(&self) -> Vec<DispatchOutcome> {
        self.run_health_check_at(Utc::now()).await
    }

    /// One snapshot, probe and evaluate pass. Any failure of the pass itself
    /// becomes a single `health_check_failed` warning.
    #[instrument(skip(self))]
    pub async fn run_health_check_at(&self, now: DateTime<Utc>) -> Vec<DispatchOutcome> {
        let candidates = match self.evaluate_cycle(now).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Health check failed: {}", e);
                vec![AlertCandidate::health_check_failed(e)]
            }
        };

        debug!(candidates = candidates.len(), "Health check evaluated");
        self.dispatch_all(candidates, now).await
    }

    async fn evaluate_cycle(&self, now: DateTime<Utc>) -> Result<Vec<AlertCandidate>> {
        let snapshot = self.snapshot_at(now)?;

        let database = match &self.database {
            Some(probe) => {
                Some(run_with_timeout("database", self.database_timeout, probe.ping()).await)
            }
            None => None,
        };
        let dependency = match &self.dependency {
            Some(probe) => Some(
                run_with_timeout("dependency", self.dependency_timeout, probe.status()).await,
            ),
            None => None,
        };

        let input = EvaluationInput {
            snapshot: &snapshot,
            database,
            dependency,
            now,
        };
        let thresholds = self.thresholds();
        Ok(self.evaluator.evaluate(&input, &thresholds))
    }

    async fn dispatch_all(
        &self,
        candidates: Vec<AlertCandidate>,
        now: DateTime<Utc>,
    ) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            outcomes.push(self.dispatcher.dispatch_at(candidate, now).await);
        }
        outcomes
    }

    /// Raise `health_check_failed` for a failure caught outside the cycle,
    /// such as a panic at the scheduler's tick boundary.
    pub async fn report_health_check_failure(&self, reason: &str) -> DispatchOutcome {
        self.dispatcher
            .dispatch(AlertCandidate::health_check_failed(reason))
            .await
    }

    pub async fn send_manual_alert(
        &self,
        severity: Severity,
        title: &str,
        detail: &str,
    ) -> DispatchOutcome {
        self.dispatcher
            .dispatch(AlertCandidate::manual(severity, title, detail))
            .await
    }

    pub fn rotate(&self) -> IntervalBucket {
        self.rotate_at(Utc::now())
    }

    pub fn rotate_at(&self, now: DateTime<Utc>) -> IntervalBucket {
        self.window.rotate(&self.recorder, now)
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Prune bucket history, slow queries and alert history.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let report = self.window.cleanup(&self.recorder, now);
        let alerts_pruned = self.dispatcher.prune_history(now, self.history_retention);
        info!(
            minute_buckets = report.minute_buckets_pruned,
            hour_buckets = report.hour_buckets_pruned,
            slow_queries = report.slow_queries_trimmed,
            alerts = alerts_pruned,
            "Retention cleanup completed"
        );
        report
    }

    pub fn alert_history(&self) -> Vec<AlertRecord> {
        self.dispatcher.alert_history()
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.dispatcher.alert_stats()
    }

    pub fn alert_stats_at(&self, now: DateTime<Utc>) -> AlertStats {
        self.dispatcher.alert_stats_at(now)
    }

    pub fn system_health(&self) -> Result<SystemHealthReport> {
        self.system_health_at(Utc::now())
    }

    pub fn system_health_at(&self, now: DateTime<Utc>) -> Result<SystemHealthReport> {
        let system = self.snapshot_at(now)?;
        let alerts = self.dispatcher.alert_stats_at(now);

        let status = if !alerts.is_healthy {
            HealthStatus::Unhealthy
        } else if alerts.warning > 0
            || system.memory.percentage_of_capacity >= DEGRADED_MEMORY_PERCENT
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(SystemHealthReport {
            status,
            recommendations: recommendations(&system, &alerts),
            alerts,
            system,
        })
    }

    /// Current metrics in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> Result<String> {
        let detailed = self.detailed_metrics()?;
        self.exporter.update_from(&detailed);
        Ok(self.exporter.gather_metrics())
    }
}

/// Assembles a [`MonitoringService`] from configuration, with optional
/// replacements for each collaborator.
pub struct MonitoringServiceBuilder {
    config: MonitorConfig,
    channel: Option<Arc<dyn NotificationChannel>>,
    facts: Option<Arc<dyn SystemFacts>>,
    database: Option<Arc<dyn DatabaseProbe>>,
    dependency: Option<Arc<dyn DependencyProbe>>,
    release_hint: Option<Arc<dyn ReleaseHint>>,
    started_at: Option<DateTime<Utc>>,
}

impl MonitoringServiceBuilder {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            channel: None,
            facts: None,
            database: None,
            dependency: None,
            release_hint: None,
            started_at: None,
        }
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn system_facts(mut self, facts: Arc<dyn SystemFacts>) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn database_probe(mut self, probe: Arc<dyn DatabaseProbe>) -> Self {
        self.database = Some(probe);
        self
    }

    pub fn dependency_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.dependency = Some(probe);
        self
    }

    pub fn release_hint(mut self, hint: Arc<dyn ReleaseHint>) -> Self {
        self.release_hint = Some(hint);
        self
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Validate the configuration and build the service. Collaborators not
    /// supplied explicitly come from configuration: a webhook channel when a
    /// URL is set (the log otherwise), sysinfo process facts, and the
    /// PostgreSQL and HTTP probes when their URLs are set.
    ///
    /// The PostgreSQL pool is created lazily and must be built inside a tokio
    /// runtime.
    pub fn build(self) -> Result<MonitoringService> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| MonitorError::Configuration(format!("{e:#}")))?;

        let channel: Arc<dyn NotificationChannel> = match (self.channel, &config.notifications.webhook_url) {
            (Some(channel), _) => channel,
            (None, Some(url)) => Arc::new(WebhookChannel::new(
                url.as_str(),
                Duration::from_secs(config.notifications.webhook_timeout_secs),
            )?),
            (None, None) => Arc::new(LogChannel),
        };

        let facts: Arc<dyn SystemFacts> = match self.facts {
            Some(facts) => facts,
            None => Arc::new(SysinfoFacts::new()?),
        };

        let database: Option<Arc<dyn DatabaseProbe>> = match (self.database, &config.probes.database_url) {
            (Some(probe), _) => Some(probe),
            (None, Some(url)) => Some(Arc::new(PostgresProbe::connect_lazy(
                url,
                config.probes.database_timeout(),
            )?)),
            (None, None) => None,
        };

        let dependency: Option<Arc<dyn DependencyProbe>> =
            match (self.dependency, &config.probes.dependency_status_url) {
                (Some(probe), _) => Some(probe),
                (None, Some(url)) => Some(Arc::new(HttpDependencyProbe::new(
                    url.as_str(),
                    config.probes.dependency_timeout(),
                )?)),
                (None, None) => None,
            };

        let evaluator = match self.release_hint {
            Some(hint) => ThresholdEvaluator::new().with_release_hint(hint),
            None => ThresholdEvaluator::new(),
        };

        info!(
            channel = channel.name(),
            database_probe = database.is_some(),
            dependency_probe = dependency.is_some(),
            cooldown_ms = config.alerting.cooldown_ms,
            "Monitoring service configured"
        );

        Ok(MonitoringService {
            recorder: Arc::new(MetricsRecorder::new(config.recorder_settings())),
            window: WindowAggregator::new(config.retention_policy()),
            snapshots: HealthSnapshotBuilder::new(
                self.started_at.unwrap_or_else(Utc::now),
                config.memory.capacity_baseline_bytes,
                facts,
            ),
            thresholds: RwLock::new(config.thresholds.clone()),
            evaluator,
            dispatcher: AlertDispatcher::new(channel, config.cooldown()),
            exporter: MetricsExporter::new()?,
            database,
            dependency,
            database_timeout: config.probes.database_timeout(),
            dependency_timeout: config.probes.dependency_timeout(),
            history_retention: config.history_retention(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{keys, NotifyError, ProbeError, ProcessFacts, StaticFacts};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const MB: u64 = 1024 * 1024;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &str) -> std::result::Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct BrokenFacts;

    impl SystemFacts for BrokenFacts {
        fn sample(&self) -> Result<ProcessFacts> {
            Err(MonitorError::SystemFacts("procfs unavailable".to_string()))
        }
    }

    struct DownDatabase;

    #[async_trait]
    impl DatabaseProbe for DownDatabase {
        async fn ping(&self) -> std::result::Result<f64, ProbeError> {
            Err(ProbeError::unreachable("database", "connection refused"))
        }
    }

    fn resident(mb: u64) -> Arc<dyn SystemFacts> {
        Arc::new(StaticFacts(ProcessFacts {
            resident_bytes: mb * MB,
            ..ProcessFacts::default()
        }))
    }

    fn service(facts: Arc<dyn SystemFacts>, channel: Arc<RecordingChannel>) -> MonitoringService {
        MonitoringService::builder(MonitorConfig::default())
            .system_facts(facts)
            .channel(channel)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_quiet_system_raises_nothing() {
        let channel = Arc::new(RecordingChannel::default());
        let service = service(resident(100), channel.clone());

        service.record_request(Some(20.0));
        assert!(service.run_health_check().await.is_empty());
        assert!(channel.sent.lock().unwrap().is_empty());

        let health = service.system_health().unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.recommendations, vec!["System is operating normally"]);
    }

    #[tokio::test]
    async fn test_memory_critical_is_sent_once_within_cooldown() {
        let channel = Arc::new(RecordingChannel::default());
        let service = service(resident(1600), channel.clone());
        let now = Utc::now();

        assert_eq!(service.run_health_check_at(now).await, vec![DispatchOutcome::Sent]);
        let second = service
            .run_health_check_at(now + chrono::Duration::seconds(30))
            .await;
        assert!(matches!(second[..], [DispatchOutcome::Suppressed { .. }]));

        let history = service.alert_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, keys::MEMORY_USAGE);
        assert_eq!(history[0].severity, Severity::Critical);
        assert_eq!(service.system_health_at(now).unwrap().status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_snapshot_failure_becomes_health_check_failed() {
        let channel = Arc::new(RecordingChannel::default());
        let service = service(Arc::new(BrokenFacts), channel.clone());

        let outcomes = service.run_health_check().await;
        assert_eq!(outcomes, vec![DispatchOutcome::Sent]);

        let history = service.alert_history();
        assert_eq!(history[0].key, keys::HEALTH_CHECK_FAILED);
        assert_eq!(history[0].severity, Severity::Warning);
        assert!(channel.sent.lock().unwrap()[0].contains("procfs unavailable"));
    }

    #[tokio::test]
    async fn test_database_failure_raises_connection_alert() {
        let channel = Arc::new(RecordingChannel::default());
        let service = MonitoringService::builder(MonitorConfig::default())
            .system_facts(resident(100))
            .channel(channel.clone())
            .database_probe(Arc::new(DownDatabase))
            .build()
            .unwrap();

        service.run_health_check().await;
        let history = service.alert_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, keys::DATABASE_CONNECTION);
        assert!(!service.alert_stats().is_healthy);
    }

    #[tokio::test]
    async fn test_threshold_update_applies_to_next_check() {
        let channel = Arc::new(RecordingChannel::default());
        let service = service(resident(600), channel.clone());

        assert!(service.run_health_check().await.is_empty());
        service
            .set_threshold(MetricKind::Memory, ThresholdLevels::new(500.0, 800.0))
            .unwrap();
        service.run_health_check().await;
        assert_eq!(service.alert_history()[0].severity, Severity::Warning);
        assert_eq!(service.system_health().unwrap().status, HealthStatus::Degraded);

        let inverted = service.set_threshold(MetricKind::Memory, ThresholdLevels::new(900.0, 800.0));
        assert!(matches!(inverted, Err(MonitorError::InvalidThreshold { .. })));
        assert_eq!(service.thresholds().memory, ThresholdLevels::new(500.0, 800.0));
    }

    #[tokio::test]
    async fn test_cleanup_prunes_alert_history() {
        let channel = Arc::new(RecordingChannel::default());
        let service = service(resident(100), channel.clone());
        let now = Utc::now();

        service.send_manual_alert(Severity::Info, "Deploy", "v2").await;
        assert_eq!(service.alert_history().len(), 1);

        service.cleanup_at(now + chrono::Duration::hours(25));
        assert!(service.alert_history().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = MonitorConfig::default();
        config.schedule.rotation_interval_secs = 0;
        let result = MonitoringService::builder(config)
            .system_facts(resident(1))
            .build();
        assert!(matches!(result, Err(MonitorError::Configuration(_))));
    }

    #[test]
    fn test_oversized_cooldown_is_rejected_at_build() {
        let mut config = MonitorConfig::default();
        config.alerting.cooldown_ms = 1 << 63;
        let result = MonitoringService::builder(config)
            .system_facts(resident(1))
            .build();
        assert!(matches!(result, Err(MonitorError::Configuration(ref m)) if m.contains("cooldown_ms")));
    }

    struct SlowDatabase;

    #[async_trait]
    impl DatabaseProbe for SlowDatabase {
        async fn ping(&self) -> std::result::Result<f64, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(5.0)
        }
    }

    struct SlowDependency;

    #[async_trait]
    impl DependencyProbe for SlowDependency {
        async fn status(&self) -> std::result::Result<crate::monitoring::DependencyStatus, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(crate::monitoring::DependencyStatus {
                initialized: true,
                rpc_latency_ms: 10.0,
                last_event_timestamp: Utc::now(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_and_dependency_checks_run_in_sequence() {
        let service = MonitoringService::builder(MonitorConfig::default())
            .system_facts(resident(100))
            .channel(Arc::new(RecordingChannel::default()))
            .database_probe(Arc::new(SlowDatabase))
            .dependency_probe(Arc::new(SlowDependency))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(service.run_health_check().await.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[test]
    fn test_prometheus_text_reflects_recorder() {
        let service = service(resident(256), Arc::new(RecordingChannel::default()));
        service.record_request(Some(10.0));
        service.record_cache_hit();

        let text = service.prometheus_text().unwrap();
        assert!(text.contains("opswatch_requests_total 1"));
        assert!(text.contains("opswatch_cache_hits_total 1"));
        assert!(text.contains("opswatch_memory_used_mb 256"));
    }
}
