use std::sync::Arc;

use examhub_common::config::AppConfig;
use examhub_common::{db, redis_pool};
use examhub_engine::bootstrap::build_engine;
use examhub_engine::scheduler::Scheduler;
use examhub_worker::consumer::EventIntake;
use examhub_worker::publisher::DeliveryEventPublisher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "examhub_worker=info,examhub_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("ExamHub notification worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    // Redis carries the event streams and the queue accelerator
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    let engine = Arc::new(build_engine(&config, pool, Some(redis.clone()))?);

    let publisher = DeliveryEventPublisher::new(redis.clone(), &config.delivery_event_stream);
    let events = engine.subscribe();
    let publisher_task = tokio::spawn(async move { publisher.run(events).await });

    let scheduler = Scheduler::from_settings(engine.clone()).start();

    let intake = EventIntake::new(
        redis,
        engine.clone(),
        &config.event_stream,
        &config.event_consumer_group,
        &config.event_consumer_name,
    );

    // Run with graceful shutdown on Ctrl+C
    let outcome = tokio::select! {
        result = intake.run() => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Event intake exited with error");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            Ok(())
        }
    };

    // Let an in-flight pass record its outcome before exiting
    scheduler.stop().await;
    publisher_task.abort();

    tracing::info!("ExamHub notification worker stopped.");
    outcome
}
