use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::window::IntervalBucket;

pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: f64 = 100.0;
pub const DEFAULT_SLOW_QUERY_CAPACITY: usize = 100;
const QUERY_FRAGMENT_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet {
    pub requests: u64,
    pub errors: u64,
    pub db_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub total_ms: f64,
    pub count: u64,
    /// `None` until the first observation.
    pub min_ms: Option<f64>,
    pub max_ms: f64,
}

impl ResponseTimeStats {
    fn observe(&mut self, latency_ms: f64) {
        self.total_ms += latency_ms;
        self.count += 1;
        self.min_ms = Some(self.min_ms.map_or(latency_ms, |min| min.min(latency_ms)));
        self.max_ms = self.max_ms.max(latency_ms);
    }

    /// Rounded mean latency, 0 when nothing has been observed.
    pub fn average_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            (self.total_ms / self.count as f64).round() as u64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub query_fragment: String,
    pub elapsed_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecorderSettings {
    pub slow_query_threshold_ms: f64,
    pub slow_query_capacity: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            slow_query_capacity: DEFAULT_SLOW_QUERY_CAPACITY,
        }
    }
}

/// Point-in-time copy of everything the recorder owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderSnapshot {
    pub counters: CounterSet,
    pub response_times: ResponseTimeStats,
    pub slow_queries: Vec<SlowQueryRecord>,
    pub current_bucket: IntervalBucket,
}

#[derive(Debug)]
struct IntervalCounter {
    started_at: DateTime<Utc>,
    requests: u64,
    errors: u64,
}

impl IntervalCounter {
    fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            requests: 0,
            errors: 0,
        }
    }

    fn as_bucket(&self, now: DateTime<Utc>) -> IntervalBucket {
        IntervalBucket {
            start_time: self.started_at,
            requests: self.requests,
            errors: self.errors,
            duration_ms: now
                .signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        }
    }
}

#[derive(Debug)]
struct RecorderState {
    counters: CounterSet,
    response_times: ResponseTimeStats,
    slow_queries: VecDeque<SlowQueryRecord>,
    interval: IntervalCounter,
}

/// Counters and latency statistics updated synchronously from instrumented
/// call sites.
///
/// Cumulative counters and the in-flight rotation interval share one lock, so
/// [`MetricsRecorder::take_interval`] never races with an increment. Recording
/// methods never fail: a poisoned lock is recovered rather than propagated.
#[derive(Debug)]
pub struct MetricsRecorder {
    settings: RecorderSettings,
    state: Mutex<RecorderState>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(RecorderSettings::default())
    }
}

impl MetricsRecorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(RecorderState {
                counters: CounterSet::default(),
                response_times: ResponseTimeStats::default(),
                slow_queries: VecDeque::with_capacity(settings.slow_query_capacity),
                interval: IntervalCounter::starting_at(Utc::now()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one completed request. Non-finite latencies are ignored and
    /// negative ones clamped to zero; the request itself is always counted.
    pub fn record_request(&self, latency_ms: Option<f64>) {
        let mut state = self.state();
        state.counters.requests += 1;
        state.interval.requests += 1;

        match latency_ms {
            Some(latency) if latency.is_finite() => state.response_times.observe(latency.max(0.0)),
            Some(latency) => debug!(latency, "Ignoring non-finite request latency"),
            None => {}
        }
    }

    pub fn record_request_duration(&self, elapsed: Duration) {
        self.record_request(Some(elapsed.as_secs_f64() * 1000.0));
    }

    pub fn record_error(&self) {
        let mut state = self.state();
        state.counters.errors += 1;
        state.interval.errors += 1;
    }

    /// Count a database query; queries slower than the configured threshold
    /// are also kept in the bounded slow-query list.
    pub fn record_db_query(&self, elapsed_ms: f64, query: &str) {
        let mut state = self.state();
        state.counters.db_queries += 1;

        if !elapsed_ms.is_finite() || elapsed_ms <= self.settings.slow_query_threshold_ms {
            return;
        }

        let query_fragment: String = query.trim().chars().take(QUERY_FRAGMENT_CHARS).collect();
        warn!(elapsed_ms, query = %query_fragment, "Slow database query");

        if state.slow_queries.len() >= self.settings.slow_query_capacity {
            state.slow_queries.pop_front();
        }
        state.slow_queries.push_back(SlowQueryRecord {
            query_fragment,
            elapsed_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn record_cache_hit(&self) {
        self.state().counters.cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.state().counters.cache_misses += 1;
    }

    /// Close the in-flight interval at `now` and start the next one.
    pub fn take_interval(&self, now: DateTime<Utc>) -> IntervalBucket {
        let mut state = self.state();
        let bucket = state.interval.as_bucket(now);
        state.interval = IntervalCounter::starting_at(now);
        bucket
    }

    /// Drop the oldest slow queries beyond capacity. Returns how many were removed.
    pub fn trim_slow_queries(&self) -> usize {
        let mut state = self.state();
        let excess = state
            .slow_queries
            .len()
            .saturating_sub(self.settings.slow_query_capacity);
        state.slow_queries.drain(..excess);
        excess
    }

    pub fn counters(&self) -> CounterSet {
        self.state().counters
    }

    pub fn response_times(&self) -> ResponseTimeStats {
        self.state().response_times
    }

    pub fn slow_query_count(&self) -> usize {
        self.state().slow_queries.len()
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let now = Utc::now();
        let state = self.state();
        RecorderSnapshot {
            counters: state.counters,
            response_times: state.response_times,
            slow_queries: state.slow_queries.iter().cloned().collect(),
            current_bucket: state.interval.as_bucket(now),
        }
    }

    /// Zero every counter and statistic. Test isolation only.
    pub fn reset(&self) {
        let mut state = self.state();
        state.counters = CounterSet::default();
        state.response_times = ResponseTimeStats::default();
        state.slow_queries.clear();
        state.interval = IntervalCounter::starting_at(Utc::now());
    }
}

/// Request timing guard that records one request (and optionally an error)
/// when dropped.
pub struct RequestTimer {
    start: Instant,
    recorder: Arc<MetricsRecorder>,
    failed: bool,
}

impl RequestTimer {
    pub fn new(recorder: Arc<MetricsRecorder>) -> Self {
        Self {
            start: Instant::now(),
            recorder,
            failed: false,
        }
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.recorder.record_request_duration(self.start.elapsed());
        if self.failed {
            self.recorder.record_error();
        }
    }
}
