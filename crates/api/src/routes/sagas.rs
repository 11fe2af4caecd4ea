//! Saga trigger, status and compensation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::affiliate_registration::{self, AffiliateRegistrationRequest};
use saga::{SagaFilter, SagaInstance, SagaStatistics, SagaStatus, SagaSummary, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppState;
use crate::error::ApiError;

const CORRELATION_HEADER: &str = "x-correlation-id";

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub saga_type: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct StartSagaResponse {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub correlation_id: String,
    pub message: String,
    pub tracking_url: String,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub correlation_id: Option<String>,
    pub failure_reason: Option<String>,
    pub steps: Vec<StepRecord>,
    pub context: Map<String, Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SagaInstance> for SagaStatusResponse {
    fn from(saga: SagaInstance) -> Self {
        Self {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            status: saga.status(),
            correlation_id: saga.correlation_id().map(str::to_string),
            failure_reason: saga.failure_reason().map(str::to_string),
            steps: saga.steps().to_vec(),
            context: saga.context().clone(),
            version: saga.version().as_i64(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

#[derive(Serialize)]
pub struct ListFilters {
    pub status: Option<SagaStatus>,
    pub saga_type: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Serialize)]
pub struct ListSagasResponse {
    pub sagas: Vec<SagaSummary>,
    /// Number of sagas on this page.
    pub count: usize,
    pub filters: ListFilters,
}

#[derive(Serialize)]
pub struct CompensateResponse {
    pub saga_id: SagaId,
    pub message: String,
}

// -- Helpers --

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|_| ApiError::BadRequest(format!("Invalid saga id: {id}")))
}

/// Uses the caller's correlation id when one is supplied.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn start_saga(
    state: &AppState,
    saga_type: &str,
    input: Value,
    headers: &HeaderMap,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    let correlation_id = correlation_id(headers);
    let saga_id = state
        .coordinator
        .start_with_correlation(saga_type, input, Some(correlation_id.clone()))
        .await?;

    tracing::info!(%saga_id, saga_type, %correlation_id, "saga started");

    Ok((
        StatusCode::ACCEPTED,
        Json(StartSagaResponse {
            saga_id,
            saga_type: saga_type.to_string(),
            status: SagaStatus::Pending,
            correlation_id,
            message: "Saga started; it runs in the background".to_string(),
            tracking_url: format!("/api/v1/sagas/{saga_id}/status"),
        }),
    ))
}

// -- Handlers --

/// POST /api/v1/sagas/complete-affiliate-registration
#[tracing::instrument(skip_all)]
pub async fn register_affiliate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AffiliateRegistrationRequest>,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    let input = request.into_input()?;
    start_saga(&state, affiliate_registration::SAGA_TYPE, input, &headers).await
}

/// POST /api/v1/sagas/{saga_type}: starts any registered saga type with raw
/// JSON input.
#[tracing::instrument(skip_all, fields(saga_type = %saga_type))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(saga_type): Path<String>,
    headers: HeaderMap,
    Json(input): Json<Value>,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    start_saga(&state, &saga_type, input, &headers).await
}

/// GET /api/v1/sagas/{id}/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let saga = state.queries.get(saga_id).await?;
    Ok(Json(saga.into()))
}

/// GET /api/v1/sagas: newest first, filtered by status and type.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListSagasResponse>, ApiError> {
    let mut filter = SagaFilter::new();
    if let Some(ref status) = params.status {
        let status: SagaStatus = status
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid status: {status}")))?;
        filter = filter.status(status);
    }
    if let Some(saga_type) = params.saga_type {
        filter = filter.saga_type(saga_type);
    }
    if let Some(limit) = params.limit {
        filter = filter.limit(limit);
    }
    if let Some(offset) = params.offset {
        filter = filter.offset(offset);
    }

    let sagas = state.queries.list(&filter).await?;
    Ok(Json(ListSagasResponse {
        count: sagas.len(),
        sagas,
        filters: ListFilters {
            status: filter.status,
            saga_type: filter.saga_type,
            limit: filter.limit,
            offset: filter.offset,
        },
    }))
}

/// GET /api/v1/sagas/statistics
pub async fn statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SagaStatistics>, ApiError> {
    Ok(Json(state.queries.statistics().await?))
}

/// POST /api/v1/sagas/{id}/compensate: operator-forced compensation.
pub async fn compensate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CompensateResponse>), ApiError> {
    let saga_id = parse_saga_id(&id)?;
    state.coordinator.force_compensate(saga_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CompensateResponse {
            saga_id,
            message: format!("Compensation triggered for saga {saga_id}"),
        }),
    ))
}
