//! Production wiring shared by the worker and API binaries.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use examhub_common::config::AppConfig;
use examhub_notifier::resend::ResendGateway;

use crate::engine::NotificationEngine;
use crate::queue::RedisQueueAccelerator;
use crate::store::PgNotificationStore;

/// Build an engine over PostgreSQL and Resend.
///
/// The Redis accelerator is attached only when a connection is supplied and
/// `QUEUE_ACCELERATOR_ENABLED` is set.
pub fn build_engine(
    config: &AppConfig,
    pool: PgPool,
    redis: Option<ConnectionManager>,
) -> anyhow::Result<NotificationEngine> {
    let api_key = config
        .resend_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("RESEND_API_KEY environment variable is required"))?;

    let gateway = ResendGateway::new(api_key, &config.resend_api_url, &config.email_from);
    let store = PgNotificationStore::new(pool);
    let mut engine =
        NotificationEngine::new(Arc::new(store), Arc::new(gateway), config.engine_settings());

    match redis {
        Some(conn) if config.queue_accelerator_enabled => {
            engine = engine.with_accelerator(Arc::new(RedisQueueAccelerator::new(conn)));
            tracing::info!("Redis queue accelerator enabled");
        }
        _ => tracing::info!("Queue accelerator disabled, dispatching straight from PostgreSQL"),
    }

    Ok(engine)
}
