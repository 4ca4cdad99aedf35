use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Disks, Pid, System};
use tracing::debug;

use super::error::{MonitorError, Result};
use super::recorder::{MetricsRecorder, SlowQueryRecord};
use super::window::{round2, IntervalBucket, WindowAggregator};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Raw process-level facts sampled from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessFacts {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_percent: Option<f64>,
    pub disk_used_percent: Option<f64>,
}

/// Source of process facts for snapshots.
pub trait SystemFacts: Send + Sync {
    fn sample(&self) -> Result<ProcessFacts>;
}

/// Samples the current process through `sysinfo`.
pub struct SysinfoFacts {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoFacts {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| MonitorError::SystemFacts(format!("cannot resolve current pid: {e}")))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }

    fn fullest_disk_percent() -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let used = disk.total_space().saturating_sub(disk.available_space());
                used as f64 / disk.total_space() as f64 * 100.0
            })
            .fold(None, |max: Option<f64>, pct| Some(max.map_or(pct, |m| m.max(pct))))
    }
}

impl SystemFacts for SysinfoFacts {
    fn sample(&self) -> Result<ProcessFacts> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_process(self.pid);
        let process = system
            .process(self.pid)
            .ok_or_else(|| MonitorError::SystemFacts(format!("process {} not found", self.pid)))?;

        Ok(ProcessFacts {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            cpu_percent: Some(process.cpu_usage() as f64),
            disk_used_percent: Self::fullest_disk_percent(),
        })
    }
}

/// Fixed facts, for hosts that measure memory themselves and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticFacts(pub ProcessFacts);

impl SystemFacts for StaticFacts {
    fn sample(&self) -> Result<ProcessFacts> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used_mb: f64,
    pub heap_mb: f64,
    pub percentage_of_capacity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_requests: u64,
    pub requests_per_minute: f64,
    pub error_rate_percent: f64,
    pub cache_hit_rate_percent: f64,
    pub avg_response_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemUsage {
    pub cpu_percent: Option<f64>,
    pub disk_used_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_minutes: u64,
    pub memory: MemoryUsage,
    pub performance: PerformanceSummary,
    pub system: SystemUsage,
}

/// Diagnostic view. Not used for alerting decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedMetrics {
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
    pub db_query_count: u64,
    pub error_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub slow_query_count: usize,
    pub slow_queries: Vec<SlowQueryRecord>,
    pub min_response_time_ms: Option<f64>,
    pub max_response_time_ms: f64,
    pub bucket_history: Vec<IntervalBucket>,
    pub hour_history: Vec<IntervalBucket>,
    pub current_bucket: IntervalBucket,
}

pub fn error_rate_percent(requests: u64, errors: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        round2(errors as f64 / requests as f64 * 100.0)
    }
}

pub fn cache_hit_rate_percent(hits: u64, misses: u64) -> f64 {
    let lookups = hits + misses;
    if lookups == 0 {
        0.0
    } else {
        round2(hits as f64 / lookups as f64 * 100.0)
    }
}

pub struct HealthSnapshotBuilder {
    started_at: DateTime<Utc>,
    capacity_baseline_bytes: u64,
    facts: Arc<dyn SystemFacts>,
}

impl HealthSnapshotBuilder {
    pub fn new(
        started_at: DateTime<Utc>,
        capacity_baseline_bytes: u64,
        facts: Arc<dyn SystemFacts>,
    ) -> Self {
        Self {
            started_at,
            capacity_baseline_bytes,
            facts,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn build(
        &self,
        recorder: &MetricsRecorder,
        window: &WindowAggregator,
        now: DateTime<Utc>,
    ) -> Result<HealthSnapshot> {
        let facts = self.facts.sample()?;
        let counters = recorder.counters();
        let response_times = recorder.response_times();

        let snapshot = HealthSnapshot {
            timestamp: now,
            uptime_minutes: now
                .signed_duration_since(self.started_at)
                .num_minutes()
                .max(0) as u64,
            memory: self.memory_usage(&facts),
            performance: PerformanceSummary {
                total_requests: counters.requests,
                requests_per_minute: window.requests_per_minute(),
                error_rate_percent: error_rate_percent(counters.requests, counters.errors),
                cache_hit_rate_percent: cache_hit_rate_percent(
                    counters.cache_hits,
                    counters.cache_misses,
                ),
                avg_response_time_ms: response_times.average_ms(),
            },
            system: SystemUsage {
                cpu_percent: facts.cpu_percent.map(round2),
                disk_used_percent: facts.disk_used_percent.map(round2),
            },
        };

        debug!(
            used_mb = snapshot.memory.used_mb,
            total_requests = snapshot.performance.total_requests,
            error_rate = snapshot.performance.error_rate_percent,
            "Built health snapshot"
        );
        Ok(snapshot)
    }

    pub fn build_detailed(
        &self,
        recorder: &MetricsRecorder,
        window: &WindowAggregator,
        now: DateTime<Utc>,
    ) -> Result<DetailedMetrics> {
        let snapshot = self.build(recorder, window, now)?;
        let recorded = recorder.snapshot();

        Ok(DetailedMetrics {
            snapshot,
            db_query_count: recorded.counters.db_queries,
            error_count: recorded.counters.errors,
            cache_hits: recorded.counters.cache_hits,
            cache_misses: recorded.counters.cache_misses,
            slow_query_count: recorded.slow_queries.len(),
            slow_queries: recorded.slow_queries,
            min_response_time_ms: recorded.response_times.min_ms,
            max_response_time_ms: recorded.response_times.max_ms,
            bucket_history: window.minute_buckets(),
            hour_history: window.hour_buckets(),
            current_bucket: recorded.current_bucket,
        })
    }

    fn memory_usage(&self, facts: &ProcessFacts) -> MemoryUsage {
        let percentage_of_capacity = if self.capacity_baseline_bytes == 0 {
            0.0
        } else {
            round2(facts.resident_bytes as f64 / self.capacity_baseline_bytes as f64 * 100.0)
        };

        MemoryUsage {
            used_mb: round2(facts.resident_bytes as f64 / BYTES_PER_MB),
            heap_mb: round2(facts.virtual_bytes as f64 / BYTES_PER_MB),
            percentage_of_capacity,
        }
    }
}
