use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::recorder::MetricsRecorder;

/// Number of most recent minute-buckets averaged for throughput.
const THROUGHPUT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBucket {
    pub start_time: DateTime<Utc>,
    pub requests: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

impl IntervalBucket {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::milliseconds(self.duration_ms as i64)
    }

    fn absorb(&mut self, other: &IntervalBucket) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.duration_ms += other.duration_ms;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub minute_retention: Duration,
    pub hour_retention: Duration,
    /// Span after which the hour accumulator is closed into an hour-bucket.
    pub hour_span: Duration,
    /// Hard caps that hold between cleanup ticks.
    pub max_minute_buckets: usize,
    pub max_hour_buckets: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            minute_retention: Duration::hours(1),
            hour_retention: Duration::hours(24),
            hour_span: Duration::hours(1),
            max_minute_buckets: 120,
            max_hour_buckets: 48,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub minute_buckets_pruned: usize,
    pub hour_buckets_pruned: usize,
    pub slow_queries_trimmed: usize,
}

#[derive(Debug, Default)]
struct WindowState {
    minute_buckets: VecDeque<IntervalBucket>,
    hour_buckets: VecDeque<IntervalBucket>,
    hour_accumulator: Option<IntervalBucket>,
}

/// Rolling minute/hour bucket history fed by periodic rotation.
#[derive(Debug, Default)]
pub struct WindowAggregator {
    policy: RetentionPolicy,
    state: Mutex<WindowState>,
}

impl WindowAggregator {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(WindowState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the recorder's current interval at `now` and append it to the
    /// minute history.
    pub fn rotate(&self, recorder: &MetricsRecorder, now: DateTime<Utc>) -> IntervalBucket {
        let bucket = recorder.take_interval(now);
        self.push_minute_bucket(bucket);
        debug!(
            requests = bucket.requests,
            errors = bucket.errors,
            duration_ms = bucket.duration_ms,
            "Rotated metrics bucket"
        );
        bucket
    }

    pub fn push_minute_bucket(&self, bucket: IntervalBucket) {
        let mut state = self.state();

        state.minute_buckets.push_back(bucket);
        while state.minute_buckets.len() > self.policy.max_minute_buckets {
            state.minute_buckets.pop_front();
        }

        let closed = match state.hour_accumulator.as_mut() {
            Some(acc) => {
                acc.absorb(&bucket);
                bucket.end_time().signed_duration_since(acc.start_time) >= self.policy.hour_span
            }
            None => {
                state.hour_accumulator = Some(bucket);
                bucket.duration_ms as i64 >= self.policy.hour_span.num_milliseconds()
            }
        };

        if closed {
            if let Some(hour) = state.hour_accumulator.take() {
                state.hour_buckets.push_back(hour);
                while state.hour_buckets.len() > self.policy.max_hour_buckets {
                    state.hour_buckets.pop_front();
                }
            }
        }
    }

    /// Drop buckets that fell out of their retention window and trim the
    /// recorder's slow-query list.
    pub fn cleanup(&self, recorder: &MetricsRecorder, now: DateTime<Utc>) -> CleanupReport {
        let minute_cutoff = now - self.policy.minute_retention;
        let hour_cutoff = now - self.policy.hour_retention;

        let (minute_buckets_pruned, hour_buckets_pruned) = {
            let mut state = self.state();
            let minutes_before = state.minute_buckets.len();
            state.minute_buckets.retain(|b| b.start_time >= minute_cutoff);
            let hours_before = state.hour_buckets.len();
            state.hour_buckets.retain(|b| b.start_time >= hour_cutoff);
            (
                minutes_before - state.minute_buckets.len(),
                hours_before - state.hour_buckets.len(),
            )
        };

        let report = CleanupReport {
            minute_buckets_pruned,
            hour_buckets_pruned,
            slow_queries_trimmed: recorder.trim_slow_queries(),
        };

        if report != CleanupReport::default() {
            info!(
                minute_buckets = report.minute_buckets_pruned,
                hour_buckets = report.hour_buckets_pruned,
                slow_queries = report.slow_queries_trimmed,
                "Pruned expired metrics history"
            );
        }
        report
    }

    /// Mean requests over the most recent minute-buckets, 0 with no history.
    pub fn requests_per_minute(&self) -> f64 {
        let state = self.state();
        let recent: Vec<_> = state
            .minute_buckets
            .iter()
            .rev()
            .take(THROUGHPUT_WINDOW)
            .collect();

        if recent.is_empty() {
            return 0.0;
        }

        let total: u64 = recent.iter().map(|b| b.requests).sum();
        round2(total as f64 / recent.len() as f64)
    }

    pub fn minute_buckets(&self) -> Vec<IntervalBucket> {
        self.state().minute_buckets.iter().copied().collect()
    }

    pub fn hour_buckets(&self) -> Vec<IntervalBucket> {
        self.state().hour_buckets.iter().copied().collect()
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
