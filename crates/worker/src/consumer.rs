//! Inbound domain events over a Redis Streams consumer group.
//!
//! Entries are acknowledged once their outcome is settled: a persisted
//! notification, an event we do not handle, or a poison message that will
//! never parse. An entry whose submit failed because the store is
//! unreachable stays pending and is re-read from this consumer's pending
//! list.

use std::sync::Arc;
use std::time::Duration;

use redis::RedisResult;
use redis::aio::ConnectionManager;

use examhub_engine::engine::NotificationEngine;
use examhub_engine::intake::DomainEvent;

/// Field holding the JSON envelope in each stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

const READ_COUNT: usize = 32;
const BLOCK_MS: u64 = 5_000;
const BACKOFF: Duration = Duration::from_secs(1);

type StreamReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

/// What to do with a stream entry after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave pending; it will be redelivered from the pending list.
    Retain,
}

/// Translate one entry's payload into a submit and decide its fate.
pub async fn handle_payload(engine: &NotificationEngine, payload: Option<&str>) -> Disposition {
    let Some(raw) = payload else {
        tracing::warn!("Stream entry has no '{}' field, dropping", PAYLOAD_FIELD);
        return Disposition::Ack;
    };

    let event = match DomainEvent::parse(raw) {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::debug!("Ignoring event this service does not handle");
            return Disposition::Ack;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed domain event");
            return Disposition::Ack;
        }
    };

    let name = event.name();
    let (request, mode) = event.into_request();
    match engine.submit_with(request, mode).await {
        Ok(id) => {
            tracing::info!(event = name, notification_id = %id, "Domain event accepted");
            Disposition::Ack
        }
        Err(e) if e.is_store_unavailable() => {
            tracing::error!(event = name, error = %e, "Store unavailable, leaving event pending");
            Disposition::Retain
        }
        Err(e) => {
            tracing::warn!(event = name, error = %e, "Domain event rejected");
            Disposition::Ack
        }
    }
}

/// Redis Streams consumer feeding the engine.
pub struct EventIntake {
    redis: ConnectionManager,
    engine: Arc<NotificationEngine>,
    stream: String,
    group: String,
    consumer: String,
}

impl EventIntake {
    pub fn new(
        redis: ConnectionManager,
        engine: Arc<NotificationEngine>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            engine,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// Create the consumer group if it doesn't exist.
    pub async fn init_group(&self) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "Created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Consume until the task is cancelled.
    ///
    /// Starts by draining this consumer's pending list (entries read before
    /// a restart but never acknowledged), then blocks for new entries.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.init_group().await?;

        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Event intake started"
        );

        let mut backlog = true;
        loop {
            let read = if backlog {
                self.read("0", None).await
            } else {
                self.read(">", Some(BLOCK_MS)).await
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "Stream read failed, retrying");
                    tokio::time::sleep(BACKOFF).await;
                    continue;
                }
            };

            if backlog && entries.is_empty() {
                backlog = false;
                continue;
            }

            let mut retained = false;
            for (entry_id, fields) in entries {
                let payload = fields
                    .iter()
                    .find(|(key, _)| key == PAYLOAD_FIELD)
                    .map(|(_, value)| value.as_str());

                match handle_payload(&self.engine, payload).await {
                    Disposition::Ack => {
                        if let Err(e) = self.ack(&entry_id).await {
                            tracing::warn!(entry_id = %entry_id, error = %e, "Failed to acknowledge entry");
                        }
                    }
                    Disposition::Retain => retained = true,
                }
            }

            if retained {
                backlog = true;
                tokio::time::sleep(BACKOFF).await;
            }
        }
    }

    async fn read(
        &self,
        start: &str,
        block_ms: Option<u64>,
    ) -> RedisResult<Vec<(String, Vec<(String, String)>)>> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer);
        if let Some(block) = block_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("COUNT")
            .arg(READ_COUNT)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(start);

        // A blocking read that times out replies nil
        let reply: Option<StreamReply> = cmd.query_async(&mut conn).await?;
        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .collect())
    }

    async fn ack(&self, entry_id: &str) -> RedisResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
