use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use super::service::MonitoringService;
use crate::config::ScheduleConfig;

/// Owns the health-check, rotation and cleanup cadences. Each runs in its own
/// task; a panicking tick is logged and the cadence carries on.
pub struct MonitorScheduler {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn spawn_cadence<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    debug!(cadence = name, "Tick");
                    if let Err(panic) = AssertUnwindSafe(tick()).catch_unwind().await {
                        error!(cadence = name, "Tick panicked: {}", panic_message(panic.as_ref()));
                    }
                }
            }
        }

        info!(cadence = name, "Cadence stopped");
    })
}

impl MonitorScheduler {
    /// Spawn the three cadences. Each first fires one period after start.
    #[instrument(skip_all, fields(
        health_check_secs = schedule.health_check_interval_secs,
        rotation_secs = schedule.rotation_interval_secs,
        cleanup_secs = schedule.cleanup_interval_secs,
    ))]
    pub fn start(service: Arc<MonitoringService>, schedule: &ScheduleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let health = {
            let service = Arc::clone(&service);
            spawn_cadence(
                "health_check",
                schedule.health_check_interval(),
                shutdown_tx.subscribe(),
                move || {
                    let service = Arc::clone(&service);
                    async move {
                        let result = AssertUnwindSafe(service.run_health_check())
                            .catch_unwind()
                            .await;
                        if let Err(panic) = result {
                            let reason = panic_message(panic.as_ref());
                            error!("Health check panicked: {}", reason);
                            service.report_health_check_failure(&reason).await;
                        }
                    }
                },
            )
        };

        let rotation = {
            let service = Arc::clone(&service);
            spawn_cadence(
                "rotation",
                schedule.rotation_interval(),
                shutdown_tx.subscribe(),
                move || {
                    let service = Arc::clone(&service);
                    async move {
                        service.rotate();
                    }
                },
            )
        };

        let cleanup = spawn_cadence(
            "cleanup",
            schedule.cleanup_interval(),
            shutdown_tx.subscribe(),
            move || {
                let service = Arc::clone(&service);
                async move {
                    service.cleanup();
                }
            },
        );

        info!("Monitoring scheduler started");
        Self {
            shutdown_tx,
            handles: vec![
                ("health_check", health),
                ("rotation", rotation),
                ("cleanup", cleanup),
            ],
        }
    }

    /// Signal every cadence to stop and wait for all of them to exit.
    pub async fn shutdown(self) {
        info!("Shutting down monitoring scheduler");
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(cadence = name, "Cadence task failed: {}", e);
            }
        }

        info!("Monitoring scheduler shutdown completed");
    }
}
