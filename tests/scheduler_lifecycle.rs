//! Scheduler cadences driven on a paused tokio clock.

use async_trait::async_trait;
use opswatch::monitoring::{MonitorError, ProcessFacts, SystemFacts};
use opswatch::{
    keys, MonitorConfig, MonitorScheduler, MonitoringService, NotificationChannel, NotifyError,
    Severity,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

#[derive(Default)]
struct InboxChannel {
    messages: Mutex<Vec<String>>,
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

/// Reports a fixed resident size, panicking on the first `panics` samples.
struct FlakyFacts {
    resident_mb: u64,
    panics: usize,
    calls: AtomicUsize,
}

impl SystemFacts for FlakyFacts {
    fn sample(&self) -> Result<ProcessFacts, MonitorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.panics {
            panic!("sampler crashed");
        }
        Ok(ProcessFacts {
            resident_bytes: self.resident_mb * MB,
            ..ProcessFacts::default()
        })
    }
}

fn service(resident_mb: u64, panics: usize, inbox: Arc<InboxChannel>) -> Arc<MonitoringService> {
    let facts = FlakyFacts {
        resident_mb,
        panics,
        calls: AtomicUsize::new(0),
    };
    Arc::new(
        MonitoringService::builder(MonitorConfig::default())
            .channel(inbox)
            .system_facts(Arc::new(facts))
            .build()
            .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_cadences_fire_on_schedule() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service(1600, 0, inbox.clone());
    let config = MonitorConfig::default();

    let scheduler = MonitorScheduler::start(Arc::clone(&service), &config.schedule);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(service.alert_history().is_empty());

    tokio::time::sleep(Duration::from_secs(32)).await;
    // Two health checks ran; the second was inside the cooldown.
    assert_eq!(inbox.messages.lock().unwrap().len(), 1);
    assert_eq!(service.alert_history()[0].key, keys::MEMORY_USAGE);
    assert_eq!(service.detailed_metrics().unwrap().bucket_history.len(), 1);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_panic_becomes_alert() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service(100, 1, inbox.clone());
    let config = MonitorConfig::default();

    let scheduler = MonitorScheduler::start(Arc::clone(&service), &config.schedule);
    tokio::time::sleep(Duration::from_secs(61)).await;

    let history = service.alert_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key, keys::HEALTH_CHECK_FAILED);
    assert_eq!(history[0].severity, Severity::Warning);
    assert!(inbox.messages.lock().unwrap()[0].contains("sampler crashed"));

    // Rotation kept running alongside the failed health check.
    assert_eq!(service.detailed_metrics().unwrap().bucket_history.len(), 1);

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_all_cadences() {
    let inbox = Arc::new(InboxChannel::default());
    let service = service(100, 0, inbox);
    let config = MonitorConfig::default();

    let scheduler = MonitorScheduler::start(Arc::clone(&service), &config.schedule);
    tokio::time::sleep(Duration::from_secs(61)).await;
    scheduler.shutdown().await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(service.detailed_metrics().unwrap().bucket_history.len(), 1);
}
