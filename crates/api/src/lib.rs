//! HTTP API for the saga orchestrator.
//!
//! Provides REST endpoints to start, inspect and compensate sagas, accept
//! integration messages and probe the remote services, with structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::affiliate_registration;
use saga::{
    IdempotentConsumer, InMemoryServices, RemoteDispatcher, RetryPolicy, SagaCoordinator,
    SagaQueryService, SagaTrigger, StepExecutor, default_definitions,
};
use saga_log::{InMemorySagaLogStore, ProcessedMessageStore, SagaLogStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Saga log shared by every handler.
pub type SharedStore = Arc<dyn SagaLogStore>;
/// Remote dispatcher shared by every saga.
pub type SharedDispatcher = Arc<dyn RemoteDispatcher>;
/// The coordinator as wired into the server.
pub type Coordinator = SagaCoordinator<SharedStore, SharedDispatcher>;
/// Idempotent consumer that starts sagas from integration messages.
pub type EventConsumer =
    IdempotentConsumer<Arc<dyn ProcessedMessageStore>, SagaTrigger<SharedStore, SharedDispatcher>>;

/// Consumer name under which processed message ids are recorded.
pub const EVENT_CONSUMER: &str = "saga-trigger";

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub coordinator: Coordinator,
    pub queries: SagaQueryService<SharedStore>,
    pub events: EventConsumer,
}

impl AppState {
    /// Wires the coordinator, query service and event consumer over one
    /// store and dispatcher.
    pub fn new<S>(
        store: S,
        dispatcher: SharedDispatcher,
        forward_retry: RetryPolicy,
        compensation_retry: RetryPolicy,
    ) -> saga::Result<Self>
    where
        S: SagaLogStore + ProcessedMessageStore + Clone + 'static,
    {
        let log: SharedStore = Arc::new(store.clone());
        let processed: Arc<dyn ProcessedMessageStore> = Arc::new(store);

        let executor = StepExecutor::new(dispatcher, forward_retry, compensation_retry);
        let coordinator = SagaCoordinator::new(log.clone(), default_definitions()?, executor);
        let trigger = SagaTrigger::new(coordinator.clone()).route(
            affiliate_registration::REQUESTED_MESSAGE_TYPE,
            affiliate_registration::SAGA_TYPE,
        );

        Ok(Self {
            coordinator,
            queries: SagaQueryService::new(log),
            events: IdempotentConsumer::new(EVENT_CONSUMER, processed, trigger),
        })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/api/v1/health/sagas", get(routes::health::sagas))
        .route(
            "/api/v1/sagas/complete-affiliate-registration",
            post(routes::sagas::register_affiliate),
        )
        .route("/api/v1/sagas", get(routes::sagas::list))
        .route("/api/v1/sagas/statistics", get(routes::sagas::statistics))
        .route("/api/v1/sagas/{id}", post(routes::sagas::start))
        .route("/api/v1/sagas/{id}/status", get(routes::sagas::status))
        .route("/api/v1/sagas/{id}/compensate", post(routes::sagas::compensate))
        .route("/api/v1/services/status", get(routes::services::status))
        .route("/api/v1/events", post(routes::events::publish))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state over an in-memory saga log and in-memory
/// remote services, using the default retry policies.
///
/// Returns the services handle so callers can inspect or fault-inject.
pub fn create_default_state() -> saga::Result<(Arc<AppState>, InMemoryServices)> {
    let services = InMemoryServices::new();
    let state = AppState::new(
        InMemorySagaLogStore::new(),
        Arc::new(services.clone()),
        RetryPolicy::default(),
        RetryPolicy::for_compensation(),
    )?;
    Ok((Arc::new(state), services))
}
