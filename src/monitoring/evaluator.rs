use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::ProbeError;
use super::keys;
use super::probes::DependencyStatus;
use super::snapshot::HealthSnapshot;
use super::{AlertCandidate, Severity};
use crate::config::{MetricKind, ThresholdConfig, ThresholdLevels};

/// Best-effort hook invoked when memory crosses its critical level, e.g. to
/// drain caches or pools. Nothing may depend on it having any effect.
pub trait ReleaseHint: Send + Sync {
    fn release(&self);
}

/// Everything one evaluation pass looks at. A probe left as `None` was not
/// configured and is not evaluated.
#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub snapshot: &'a HealthSnapshot,
    pub database: Option<Result<f64, ProbeError>>,
    pub dependency: Option<Result<DependencyStatus, ProbeError>>,
    pub now: DateTime<Utc>,
}

#[derive(Default, Clone)]
pub struct ThresholdEvaluator {
    release_hint: Option<Arc<dyn ReleaseHint>>,
}

/// Critical is checked first, so a value past both levels only grades critical.
fn grade(value: f64, levels: ThresholdLevels) -> Option<Severity> {
    if value >= levels.critical {
        Some(Severity::Critical)
    } else if value >= levels.warning {
        Some(Severity::Warning)
    } else {
        None
    }
}

fn threshold_for(severity: Severity, levels: ThresholdLevels) -> f64 {
    if severity >= Severity::Critical {
        levels.critical
    } else {
        levels.warning
    }
}

impl ThresholdEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_release_hint(mut self, hint: Arc<dyn ReleaseHint>) -> Self {
        self.release_hint = Some(hint);
        self
    }

    /// Produce zero or more candidates, at most one per alert key.
    pub fn evaluate(
        &self,
        input: &EvaluationInput<'_>,
        thresholds: &ThresholdConfig,
    ) -> Vec<AlertCandidate> {
        let snapshot = input.snapshot;
        let mut candidates = Vec::new();

        let memory = thresholds.get(MetricKind::Memory);
        if let Some(severity) = grade(snapshot.memory.used_mb, memory) {
            if severity == Severity::Critical {
                self.hint_release();
            }
            candidates.push(AlertCandidate::keyed(
                keys::MEMORY_USAGE,
                severity,
                "High memory usage",
                format!(
                    "Memory usage is {:.1}MB ({:.1}% of capacity), threshold {}MB",
                    snapshot.memory.used_mb,
                    snapshot.memory.percentage_of_capacity,
                    threshold_for(severity, memory)
                ),
            ));
        }

        let performance = &snapshot.performance;
        self.check_metric(
            &mut candidates,
            keys::RESPONSE_TIME,
            "Slow response times",
            MetricKind::ResponseTime,
            performance.avg_response_time_ms as f64,
            thresholds,
        );
        self.check_metric(
            &mut candidates,
            keys::ERROR_RATE,
            "High error rate",
            MetricKind::ErrorRate,
            performance.error_rate_percent,
            thresholds,
        );
        if let Some(cpu) = snapshot.system.cpu_percent {
            self.check_metric(
                &mut candidates,
                keys::CPU_USAGE,
                "High CPU usage",
                MetricKind::Cpu,
                cpu,
                thresholds,
            );
        }
        if let Some(disk) = snapshot.system.disk_used_percent {
            self.check_metric(
                &mut candidates,
                keys::DISK_SPACE,
                "Low disk space",
                MetricKind::DiskSpace,
                disk,
                thresholds,
            );
        }

        match &input.database {
            Some(Ok(latency_ms)) => debug!(latency_ms, "Database probe healthy"),
            Some(Err(e)) => candidates.push(AlertCandidate::keyed(
                keys::DATABASE_CONNECTION,
                Severity::Critical,
                "Database unreachable",
                format!("Database health probe failed: {e}"),
            )),
            None => {}
        }

        match &input.dependency {
            Some(Ok(status)) => self.check_dependency(&mut candidates, status, input.now, thresholds),
            Some(Err(e)) => candidates.push(AlertCandidate::keyed(
                keys::DEPENDENCY_CONNECTION,
                Severity::Critical,
                "Dependency unreachable",
                format!("Dependency status probe failed: {e}"),
            )),
            None => {}
        }

        candidates
    }

    fn check_metric(
        &self,
        candidates: &mut Vec<AlertCandidate>,
        key: &str,
        title: &str,
        kind: MetricKind,
        value: f64,
        thresholds: &ThresholdConfig,
    ) {
        let levels = thresholds.get(kind);
        if let Some(severity) = grade(value, levels) {
            candidates.push(AlertCandidate::keyed(
                key,
                severity,
                title,
                format!(
                    "{kind} is {value:.2}{unit}, threshold {threshold}{unit}",
                    unit = kind.unit(),
                    threshold = threshold_for(severity, levels)
                ),
            ));
        }
    }

    fn check_dependency(
        &self,
        candidates: &mut Vec<AlertCandidate>,
        status: &DependencyStatus,
        now: DateTime<Utc>,
        thresholds: &ThresholdConfig,
    ) {
        if !status.initialized {
            candidates.push(AlertCandidate::keyed(
                keys::DEPENDENCY_NOT_INITIALIZED,
                Severity::Critical,
                "Dependency not initialized",
                "The dependency reports it has not finished initializing",
            ));
        }

        self.check_metric(
            candidates,
            keys::DEPENDENCY_LATENCY,
            "Dependency latency high",
            MetricKind::DependencyLatency,
            status.rpc_latency_ms,
            thresholds,
        );

        // Freshness is meaningless until the dependency has started.
        if status.initialized {
            let stale_secs = now
                .signed_duration_since(status.last_event_timestamp)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            self.check_metric(
                candidates,
                keys::DEPENDENCY_STALE,
                "Dependency events stale",
                MetricKind::DependencyStaleness,
                stale_secs,
                thresholds,
            );
        }
    }

    fn hint_release(&self) {
        if let Some(hint) = &self.release_hint {
            warn!("Memory critical, requesting resource release");
            hint.release();
        }
    }
}
