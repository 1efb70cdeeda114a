//! ExamHub notification API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use examhub_common::config::AppConfig;
use examhub_common::db::create_pool;
use examhub_common::redis_pool::create_redis_pool;
use examhub_engine::bootstrap::build_engine;

use examhub_api::routes::create_router;
use examhub_api::state::AppState;

/// Submit bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("examhub_api=debug,examhub_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting ExamHub notification API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;

    // The accelerator is optional here; submits still land in PostgreSQL
    let redis = if config.queue_accelerator_enabled {
        match create_redis_pool(&config.redis_url).await {
            Ok(redis) => Some(redis),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, continuing without queue accelerator");
                None
            }
        }
    } else {
        None
    };

    // Build application state
    let engine = build_engine(&config, pool, redis)?;
    let state = AppState::new(Arc::new(engine));

    // Build router
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
