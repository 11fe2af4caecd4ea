//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::{AppState, SharedDispatcher};
use saga::HttpDispatcher;
use saga_log::{InMemorySagaLogStore, PostgresSagaLogStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Open the saga log and wire the coordinator
    let dispatcher: SharedDispatcher = Arc::new(HttpDispatcher::new(config.services.clone())?);
    let (state, pg_store) = match config.database_url {
        Some(ref url) => {
            let store = PostgresSagaLogStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga log");
            let state = AppState::new(
                store.clone(),
                dispatcher,
                config.forward_retry.clone(),
                config.compensation_retry.clone(),
            )?;
            (state, Some(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, sagas are kept in memory only");
            let state = AppState::new(
                InMemorySagaLogStore::new(),
                dispatcher,
                config.forward_retry.clone(),
                config.compensation_retry.clone(),
            )?;
            (state, None)
        }
    };
    let state = Arc::new(state);

    // 4. Resume sagas a previous process left unfinished
    let resumed = state.coordinator.recover().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resuming unfinished sagas");
    }

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting saga orchestrator");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(store) = pg_store {
        store.close().await;
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}
