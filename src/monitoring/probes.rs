use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::ProbeError;

/// Facts reported by the RPC/dependency status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub initialized: bool,
    pub rpc_latency_ms: f64,
    /// Unix milliseconds of the last event the dependency processed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_event_timestamp: DateTime<Utc>,
}

/// Database liveness probe supplied by the host application.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// Round-trip latency in milliseconds.
    async fn ping(&self) -> Result<f64, ProbeError>;
}

/// Dependency status probe supplied by the host application.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn status(&self) -> Result<DependencyStatus, ProbeError>;
}

/// Run a probe future under a hard timeout.
pub async fn run_with_timeout<T, F>(probe: &str, timeout: Duration, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout {
            probe: probe.to_string(),
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Pings PostgreSQL with `SELECT 1`.
#[derive(Debug, Clone)]
pub struct PostgresProbe {
    pool: PgPool,
}

impl PostgresProbe {
    /// Builds a lazily connecting single-connection pool; nothing is dialed
    /// until the first ping.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, ProbeError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|e| ProbeError::unreachable("database", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseProbe for PostgresProbe {
    async fn ping(&self) -> Result<f64, ProbeError> {
        let start = Instant::now();
        sqlx::query("SELECT 1 as health_check")
            .execute(&self.pool)
            .await
            .map_err(|e| ProbeError::unreachable("database", e))?;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(latency_ms, "Database ping succeeded");
        Ok(latency_ms)
    }
}

/// Reads [`DependencyStatus`] as JSON from an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpDependencyProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpDependencyProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::unreachable("dependency", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DependencyProbe for HttpDependencyProbe {
    async fn status(&self) -> Result<DependencyStatus, ProbeError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::unreachable("dependency", e))?;

        response
            .json::<DependencyStatus>()
            .await
            .map_err(|e| ProbeError::InvalidResponse {
                probe: "dependency".to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_probe_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ProbeError>(1.0)
        };

        let result = run_with_timeout("database", Duration::from_secs(5), slow).await;
        assert_eq!(
            result,
            Err(ProbeError::Timeout {
                probe: "database".to_string(),
                after_ms: 5000
            })
        );
    }

    #[tokio::test]
    async fn test_fast_probe_passes_through() {
        let result =
            run_with_timeout("database", Duration::from_secs(5), async { Ok::<_, ProbeError>(3.5) })
                .await;
        assert_eq!(result, Ok(3.5));
    }

    #[test]
    fn test_dependency_status_wire_format() {
        let status: DependencyStatus = serde_json::from_str(
            r#"{"initialized": true, "rpc_latency_ms": 120.5, "last_event_timestamp": 1700000000000}"#,
        )
        .unwrap();
        assert!(status.initialized);
        assert_eq!(status.rpc_latency_ms, 120.5);
        assert_eq!(status.last_event_timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_unreachable_dependency_endpoint() {
        // Port 9 (discard) on localhost is closed in test environments.
        let probe =
            HttpDependencyProbe::new("http://127.0.0.1:9/status", Duration::from_secs(2)).unwrap();
        let result = probe.status().await;
        assert!(matches!(result, Err(ProbeError::Unreachable { .. })));
    }
}
