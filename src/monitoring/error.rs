use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Invalid threshold for {metric}: warning {warning} must be below critical {critical}")]
    InvalidThreshold {
        metric: String,
        warning: f64,
        critical: f64,
    },

    #[error("System facts unavailable: {0}")]
    SystemFacts(String),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of an external health probe. Always mapped to a critical alert,
/// never propagated out of an evaluation cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("{probe} probe timed out after {after_ms}ms")]
    Timeout { probe: String, after_ms: u64 },

    #[error("{probe} unreachable: {reason}")]
    Unreachable { probe: String, reason: String },

    #[error("{probe} returned an invalid response: {reason}")]
    InvalidResponse { probe: String, reason: String },
}

impl ProbeError {
    pub fn unreachable(probe: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreachable {
            probe: probe.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("Notification channel {channel} rejected message: {reason}")]
    Rejected { channel: String, reason: String },

    #[error("Notification channel {channel} unavailable: {reason}")]
    Unavailable { channel: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MonitorError>;
