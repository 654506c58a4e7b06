//! Health check endpoints for Kubernetes probes and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;

/// Detailed health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: String,
    /// Service version
    pub version: String,
    /// Individual subsystem statuses
    pub subsystems: SubsystemStatus,
}

/// Status of individual subsystems.
#[derive(Debug, Serialize)]
pub struct SubsystemStatus {
    /// Database connection status
    pub database: ComponentStatus,
}

/// Status of a single component.
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    /// Whether the component is healthy
    pub healthy: bool,
    /// Optional message with details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Latency of the health check in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Full health check with subsystem status.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let db_healthy = state.db.health_check().await.is_ok();
    let latency_ms = start.elapsed().as_millis() as u64;

    let health = HealthStatus {
        status: if db_healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subsystems: SubsystemStatus {
            database: ComponentStatus {
                healthy: db_healthy,
                message: (!db_healthy).then(|| "Database connection failed".to_string()),
                latency_ms: Some(latency_ms),
            },
        },
    };

    let status_code = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Kubernetes liveness probe.
///
/// Returns 200 if the service is running.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Kubernetes readiness probe.
///
/// Returns 200 once the database is reachable. Without it no login can
/// complete, so the pod should not receive traffic.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if state.db.health_check().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}
