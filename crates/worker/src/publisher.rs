//! Forwards delivery-outcome events to a Redis stream.

use redis::RedisResult;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;

use examhub_common::types::DeliveryEvent;

use crate::consumer::PAYLOAD_FIELD;

pub struct DeliveryEventPublisher {
    redis: ConnectionManager,
    stream: String,
}

impl DeliveryEventPublisher {
    pub fn new(redis: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            redis,
            stream: stream.into(),
        }
    }

    /// Publish until the engine's event channel closes.
    ///
    /// Events are advisory: a failed publish is logged and dropped.
    pub async fn run(&self, mut events: broadcast::Receiver<DeliveryEvent>) {
        tracing::info!(stream = %self.stream, "Delivery event publisher started");

        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.publish(&event).await {
                        tracing::warn!(
                            notification_id = %event.notification_id,
                            event = %event.event,
                            error = %e,
                            "Failed to publish delivery event"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Delivery event publisher lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        tracing::info!("Delivery event publisher stopped");
    }

    async fn publish(&self, event: &DeliveryEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.redis.clone();

        let entry_id: RedisResult<String> = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .query_async(&mut conn)
            .await;

        let entry_id = entry_id?;
        tracing::debug!(entry_id = %entry_id, event = %event.event, "Published delivery event");
        Ok(())
    }
}
