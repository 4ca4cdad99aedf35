use prometheus::{Gauge, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use super::error::Result;
use super::snapshot::DetailedMetrics;

/// Prometheus gauges mirroring the recorder and window aggregator.
pub struct MetricsExporter {
    registry: Registry,

    pub requests_total: IntGauge,
    pub errors_total: IntGauge,
    pub db_queries_total: IntGauge,
    pub cache_hits_total: IntGauge,
    pub cache_misses_total: IntGauge,
    pub slow_queries: IntGauge,
    pub uptime_minutes: IntGauge,

    pub avg_response_time_ms: Gauge,
    pub max_response_time_ms: Gauge,
    pub error_rate_percent: Gauge,
    pub cache_hit_rate_percent: Gauge,
    pub requests_per_minute: Gauge,
    pub memory_used_mb: Gauge,
    pub memory_capacity_percent: Gauge,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            requests_total: int_gauge(
                &registry,
                "opswatch_requests_total",
                "Requests recorded since start",
            )?,
            errors_total: int_gauge(&registry, "opswatch_errors_total", "Errors recorded since start")?,
            db_queries_total: int_gauge(
                &registry,
                "opswatch_db_queries_total",
                "Database queries recorded since start",
            )?,
            cache_hits_total: int_gauge(&registry, "opswatch_cache_hits_total", "Cache hits")?,
            cache_misses_total: int_gauge(&registry, "opswatch_cache_misses_total", "Cache misses")?,
            slow_queries: int_gauge(
                &registry,
                "opswatch_slow_queries",
                "Slow queries currently retained",
            )?,
            uptime_minutes: int_gauge(&registry, "opswatch_uptime_minutes", "Minutes since start")?,
            avg_response_time_ms: gauge(
                &registry,
                "opswatch_avg_response_time_ms",
                "Mean request latency in milliseconds",
            )?,
            max_response_time_ms: gauge(
                &registry,
                "opswatch_max_response_time_ms",
                "Slowest request latency in milliseconds",
            )?,
            error_rate_percent: gauge(
                &registry,
                "opswatch_error_rate_percent",
                "Errors as a percentage of requests",
            )?,
            cache_hit_rate_percent: gauge(
                &registry,
                "opswatch_cache_hit_rate_percent",
                "Cache hits as a percentage of lookups",
            )?,
            requests_per_minute: gauge(
                &registry,
                "opswatch_requests_per_minute",
                "Mean requests per minute over the last ten minutes",
            )?,
            memory_used_mb: gauge(
                &registry,
                "opswatch_memory_used_mb",
                "Resident memory of the process in MB",
            )?,
            memory_capacity_percent: gauge(
                &registry,
                "opswatch_memory_capacity_percent",
                "Resident memory as a percentage of the capacity baseline",
            )?,
            registry,
        })
    }

    pub fn update_from(&self, metrics: &DetailedMetrics) {
        let snapshot = &metrics.snapshot;
        let performance = &snapshot.performance;

        self.requests_total.set(performance.total_requests as i64);
        self.errors_total.set(metrics.error_count as i64);
        self.db_queries_total.set(metrics.db_query_count as i64);
        self.cache_hits_total.set(metrics.cache_hits as i64);
        self.cache_misses_total.set(metrics.cache_misses as i64);
        self.slow_queries.set(metrics.slow_query_count as i64);
        self.uptime_minutes.set(snapshot.uptime_minutes as i64);

        self.avg_response_time_ms
            .set(performance.avg_response_time_ms as f64);
        self.max_response_time_ms.set(metrics.max_response_time_ms);
        self.error_rate_percent.set(performance.error_rate_percent);
        self.cache_hit_rate_percent
            .set(performance.cache_hit_rate_percent);
        self.requests_per_minute.set(performance.requests_per_minute);
        self.memory_used_mb.set(snapshot.memory.used_mb);
        self.memory_capacity_percent
            .set(snapshot.memory.percentage_of_capacity);
    }

    /// Current gauges in Prometheus text exposition format.
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}
