//! End-to-end scenarios through the public `MonitoringService` API.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use opswatch::monitoring::{ProcessFacts, StaticFacts};
use opswatch::{
    keys, DatabaseProbe, DependencyProbe, DependencyStatus, DispatchOutcome, HealthStatus,
    MonitorConfig, MonitoringService, NotificationChannel, NotifyError, ProbeError, Severity,
};
use std::sync::{Arc, Mutex};

const MB: u64 = 1024 * 1024;

#[derive(Default)]
struct InboxChannel {
    messages: Mutex<Vec<String>>,
}

impl InboxChannel {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for InboxChannel {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

struct RejectingChannel;

#[async_trait]
impl NotificationChannel for RejectingChannel {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn send(&self, _message: &str) -> Result<(), NotifyError> {
        Err(NotifyError::Rejected {
            channel: "rejecting".to_string(),
            reason: "HTTP 403".to_string(),
        })
    }
}

/// A database that never answers.
struct HangingDatabase;

#[async_trait]
impl DatabaseProbe for HangingDatabase {
    async fn ping(&self) -> Result<f64, ProbeError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(1.0)
    }
}

struct FixedDependency(DependencyStatus);

#[async_trait]
impl DependencyProbe for FixedDependency {
    async fn status(&self) -> Result<DependencyStatus, ProbeError> {
        Ok(self.0)
    }
}

fn facts(resident_mb: u64) -> Arc<StaticFacts> {
    Arc::new(StaticFacts(ProcessFacts {
        resident_bytes: resident_mb * MB,
        ..ProcessFacts::default()
    }))
}

fn service_with(channel: Arc<dyn NotificationChannel>, resident_mb: u64) -> MonitoringService {
    MonitoringService::builder(MonitorConfig::default())
        .channel(channel)
        .system_facts(facts(resident_mb))
        .build()
        .unwrap()
}

#[test]
fn test_latency_statistics_scenario() {
    let service = service_with(Arc::new(InboxChannel::default()), 100);
    for latency in [50.0, 100.0, 150.0] {
        service.record_request(Some(latency));
    }

    let metrics = service.detailed_metrics().unwrap();
    assert_eq!(metrics.snapshot.performance.total_requests, 3);
    assert_eq!(metrics.snapshot.performance.avg_response_time_ms, 100);
    assert_eq!(metrics.min_response_time_ms, Some(50.0));
    assert_eq!(metrics.max_response_time_ms, 150.0);
}

#[test]
fn test_rates_are_guarded_and_rounded() {
    let service = service_with(Arc::new(InboxChannel::default()), 100);
    let empty = service.snapshot().unwrap();
    assert_eq!(empty.performance.error_rate_percent, 0.0);
    assert_eq!(empty.performance.cache_hit_rate_percent, 0.0);

    for _ in 0..20 {
        service.record_request(None);
    }
    service.record_error();
    service.record_cache_hit();
    service.record_cache_miss();
    service.record_cache_miss();

    let snapshot = service.snapshot().unwrap();
    assert_eq!(snapshot.performance.error_rate_percent, 5.0);
    assert_eq!(snapshot.performance.cache_hit_rate_percent, 33.33);
}

#[test]
fn test_slow_query_list_keeps_most_recent_hundred() {
    let service = service_with(Arc::new(InboxChannel::default()), 100);
    for i in 0..150 {
        service.record_db_query(500.0, &format!("SELECT {i}"));
    }

    let metrics = service.detailed_metrics().unwrap();
    assert_eq!(metrics.slow_query_count, 100);
    assert_eq!(metrics.slow_queries.first().unwrap().query_fragment, "SELECT 50");
    assert_eq!(metrics.slow_queries.last().unwrap().query_fragment, "SELECT 149");
    assert_eq!(metrics.db_query_count, 150);
}

#[test]
fn test_rotation_and_cleanup_retain_one_hour() {
    let service = service_with(Arc::new(InboxChannel::default()), 100);
    let start = service.detailed_metrics().unwrap().current_bucket.start_time;

    for tick in 1..=70 {
        service.record_request(Some(10.0));
        service.rotate_at(start + Duration::seconds(60 * tick));
    }
    service.cleanup_at(start + Duration::seconds(60 * 70));

    let metrics = service.detailed_metrics().unwrap();
    assert_eq!(metrics.bucket_history.len(), 60);
    assert_eq!(metrics.bucket_history[0].start_time, start + Duration::minutes(10));
    assert!(metrics.bucket_history.iter().all(|b| b.requests == 1));
    assert_eq!(metrics.hour_history.len(), 1);
    assert_eq!(metrics.snapshot.performance.requests_per_minute, 1.0);
}

#[tokio::test]
async fn test_memory_critical_emits_single_candidate() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service_with(inbox.clone(), 1600);

    let outcomes = service.run_health_check().await;
    assert_eq!(outcomes, vec![DispatchOutcome::Sent]);

    let history = service.alert_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key, keys::MEMORY_USAGE);
    assert_eq!(history[0].severity, Severity::Critical);
    assert!(inbox.messages()[0].contains("[CRITICAL]"));
}

#[tokio::test]
async fn test_cooldown_window_across_health_checks() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service_with(inbox.clone(), 1600);
    let t0 = Utc::now();

    service.run_health_check_at(t0).await;
    let within = service.run_health_check_at(t0 + Duration::seconds(60)).await;
    assert!(matches!(within[..], [DispatchOutcome::Suppressed { .. }]));

    let after = service
        .run_health_check_at(t0 + Duration::milliseconds(301_000))
        .await;
    assert_eq!(after, vec![DispatchOutcome::Sent]);
    assert_eq!(inbox.messages().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_database_timeout_alerts_once_and_marks_unhealthy() {
    let inbox = Arc::new(InboxChannel::default());
    let service = MonitoringService::builder(MonitorConfig::default())
        .channel(inbox.clone())
        .system_facts(facts(100))
        .database_probe(Arc::new(HangingDatabase))
        .build()
        .unwrap();
    let t0 = Utc::now();

    let first = service.run_health_check_at(t0).await;
    assert_eq!(first, vec![DispatchOutcome::Sent]);
    let second = service.run_health_check_at(t0 + Duration::seconds(30)).await;
    assert!(matches!(second[..], [DispatchOutcome::Suppressed { .. }]));

    assert_eq!(inbox.messages().len(), 1);
    assert!(inbox.messages()[0].contains("timed out after 5000ms"));

    let history = service.alert_history();
    assert_eq!(history[0].key, keys::DATABASE_CONNECTION);
    assert_eq!(history[0].severity, Severity::Critical);

    assert!(!service.alert_stats_at(t0 + Duration::hours(23)).is_healthy);
    assert!(service.alert_stats_at(t0 + Duration::hours(25)).is_healthy);
}

#[tokio::test]
async fn test_stale_dependency_is_reported() {
    let inbox = Arc::new(InboxChannel::default());
    let now = Utc::now();
    let status = DependencyStatus {
        initialized: true,
        rpc_latency_ms: 50.0,
        last_event_timestamp: now - Duration::seconds(1000),
    };
    let service = MonitoringService::builder(MonitorConfig::default())
        .channel(inbox.clone())
        .system_facts(facts(100))
        .dependency_probe(Arc::new(FixedDependency(status)))
        .build()
        .unwrap();

    service.run_health_check_at(now).await;
    let history = service.alert_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key, keys::DEPENDENCY_STALE);
    assert_eq!(history[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_rejected_delivery_is_still_recorded() {
    let service = service_with(Arc::new(RejectingChannel), 1600);

    let outcomes = service.run_health_check().await;
    assert!(matches!(outcomes[..], [DispatchOutcome::SendFailed { .. }]));
    assert_eq!(service.alert_history().len(), 1);
}

#[tokio::test]
async fn test_system_health_report() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service_with(inbox.clone(), 1900);

    service.run_health_check().await;
    let report = service.system_health().unwrap();

    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert_eq!(report.alerts.critical, 1);
    assert!(report.system.memory.percentage_of_capacity >= 90.0);
    assert!(report.recommendations[0].contains("of capacity"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "unhealthy");
    assert!(json["recommendations"].is_array());
}

#[tokio::test]
async fn test_manual_alerts_always_delivered() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service_with(inbox.clone(), 100);

    for _ in 0..2 {
        let outcome = service
            .send_manual_alert(Severity::Info, "Maintenance window", "Starting at 02:00 UTC")
            .await;
        assert_eq!(outcome, DispatchOutcome::Sent);
    }
    assert_eq!(inbox.messages().len(), 2);
    assert!(inbox.messages()[0].contains("Review when convenient"));
}
