pub mod config;
pub mod monitoring;

pub use config::{MetricKind, MonitorConfig, ThresholdConfig, ThresholdLevels};

pub use monitoring::{
    keys, AlertCandidate, AlertDispatcher, AlertRecord, AlertStats, DatabaseProbe,
    DependencyProbe, DependencyStatus, DispatchOutcome, HealthSnapshot, HealthStatus,
    MetricsRecorder, MonitorError, MonitorScheduler, MonitoringService, NotificationChannel,
    NotifyError, ProbeError, RequestTimer, Severity, SystemHealthReport, ThresholdEvaluator,
    WindowAggregator,
};
