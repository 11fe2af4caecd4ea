//! Integration message intake.

use std::pin::Pin;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::{MessageId, SagaId};
use saga::{Delivery, IntegrationMessage};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct EventAcceptedResponse {
    pub message_id: MessageId,
    /// `started`, `ignored` (no saga listens) or `duplicate`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<SagaId>,
}

/// POST /api/v1/events: accepts an integration message.
///
/// Redeliveries of a message id already handled are acknowledged without
/// starting anything.
#[tracing::instrument(
    skip_all,
    fields(message_id = %message.message_id, message_type = %message.message_type)
)]
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Json(message): Json<IntegrationMessage>,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), ApiError> {
    let consume: Pin<Box<dyn Future<Output = saga::Result<_>> + Send + '_>> =
        Box::pin(state.events.consume(&message));
    let (outcome, saga_id) = match consume.await? {
        Delivery::Handled(Some(saga_id)) => ("started", Some(saga_id)),
        Delivery::Handled(None) => ("ignored", None),
        Delivery::Duplicate => ("duplicate", None),
    };
    metrics::counter!("saga_events_received_total", "outcome" => outcome).increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse {
            message_id: message.message_id,
            outcome,
            saga_id,
        }),
    ))
}
