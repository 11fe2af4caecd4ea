//! Remote service status.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use saga::{RemoteDispatcher, ServiceHealth};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct ServicesStatusResponse {
    pub timestamp: DateTime<Utc>,
    pub all_healthy: bool,
    pub services: Vec<ServiceHealth>,
}

/// GET /api/v1/services/status: probes every remote service's health endpoint.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<ServicesStatusResponse> {
    let services = state.coordinator.dispatcher().check_services().await;
    Json(ServicesStatusResponse {
        timestamp: Utc::now(),
        all_healthy: services.iter().all(|s| s.healthy),
        services,
    })
}
