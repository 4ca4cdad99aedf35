pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod exporter;
pub mod probes;
pub mod recorder;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod window;

pub use channels::*;
pub use dispatcher::*;
pub use error::{MonitorError, NotifyError, ProbeError};
pub use evaluator::*;
pub use exporter::*;
pub use probes::*;
pub use recorder::*;
pub use scheduler::*;
pub use service::*;
pub use snapshot::*;
pub use window::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert keys produced by the evaluator and health-check cycle.
pub mod keys {
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const RESPONSE_TIME: &str = "response_time";
    pub const ERROR_RATE: &str = "error_rate";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const DISK_SPACE: &str = "disk_space";
    pub const DATABASE_CONNECTION: &str = "database_connection";
    pub const DEPENDENCY_CONNECTION: &str = "dependency_connection";
    pub const DEPENDENCY_LATENCY: &str = "dependency_latency";
    pub const DEPENDENCY_STALE: &str = "dependency_stale";
    pub const DEPENDENCY_NOT_INITIALIZED: &str = "dependency_not_initialized";
    pub const HEALTH_CHECK_FAILED: &str = "health_check_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Emergency => "EMERGENCY",
        }
    }

    pub fn requires_immediate_action(&self) -> bool {
        *self >= Severity::Critical
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An alert proposed by evaluation, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    /// Deduplication key; `None` for manual alerts, which are never suppressed.
    pub key: Option<String>,
    pub title: String,
    pub detail: String,
    pub severity: Severity,
}

impl AlertCandidate {
    pub fn keyed(
        key: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            title: title.into(),
            detail: detail.into(),
            severity,
        }
    }

    pub fn manual(severity: Severity, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            key: None,
            title: title.into(),
            detail: detail.into(),
            severity,
        }
    }

    pub fn health_check_failed(reason: impl fmt::Display) -> Self {
        Self::keyed(
            keys::HEALTH_CHECK_FAILED,
            Severity::Warning,
            "Health check failed",
            format!("The periodic health check could not complete: {reason}"),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}
