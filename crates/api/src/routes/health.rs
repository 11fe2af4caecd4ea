//! Health check endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::SagaStatistics;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /health: liveness.
pub async fn check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct SagaHealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SagaStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /api/v1/health/sagas: saga log connectivity and counts.
///
/// Answers 503 when the saga log cannot be reached.
pub async fn sagas(State(state): State<Arc<AppState>>) -> (StatusCode, Json<SagaHealthResponse>) {
    let result = match state.queries.ping().await {
        Ok(()) => state.queries.statistics().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(statistics) => (
            StatusCode::OK,
            Json(SagaHealthResponse {
                status: "healthy",
                store: "connected",
                statistics: Some(statistics),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "saga health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SagaHealthResponse {
                    status: "unhealthy",
                    store: "disconnected",
                    statistics: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
