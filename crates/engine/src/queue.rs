//! Dispatch-ready view over the store.
//!
//! An optional [`QueueAccelerator`] (a Redis sorted set) mirrors the queued
//! records in dispatch order for readers outside this process. Claims always go
//! through the store's ordered conditional claim, so a missing, stale or
//! unreachable mirror changes nothing about what is dispatched or in what order.
//! Claimed and finished records are trimmed from the mirror.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use examhub_common::error::AppError;
use examhub_common::types::NotificationRecord;

use crate::store::NotificationStore;

/// Default sorted-set key.
pub const DEFAULT_QUEUE_KEY: &str = "notifications:queue";

/// Weight that keeps priority tiers apart in the score; larger than any
/// millisecond timestamp this system will see.
const PRIORITY_WEIGHT: f64 = 1e13;

/// Sorted mirror of the dispatch queue. Never the source of truth.
#[async_trait]
pub trait QueueAccelerator: Send + Sync {
    async fn enqueue(&self, record: &NotificationRecord) -> Result<(), AppError>;

    async fn remove(&self, ids: &[Uuid]) -> Result<(), AppError>;
}

/// Sorted-set score: ascending order is priority-descending, then FIFO.
pub fn queue_score(record: &NotificationRecord) -> f64 {
    f64::from(100 - record.priority.score()) * PRIORITY_WEIGHT
        + record.created_at.timestamp_millis() as f64
}

/// Redis `ZSET` accelerator.
pub struct RedisQueueAccelerator {
    redis: ConnectionManager,
    key: String,
}

impl RedisQueueAccelerator {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_key(redis, DEFAULT_QUEUE_KEY)
    }

    pub fn with_key(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }
}

#[async_trait]
impl QueueAccelerator for RedisQueueAccelerator {
    async fn enqueue(&self, record: &NotificationRecord) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(&self.key, record.id.to_string(), queue_score(record))
            .await?;
        Ok(())
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let members: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        conn.zrem::<_, _, ()>(&self.key, members).await?;
        Ok(())
    }
}

/// Records eligible for immediate dispatch.
#[derive(Clone)]
pub struct DeliveryQueue {
    store: Arc<dyn NotificationStore>,
    accelerator: Option<Arc<dyn QueueAccelerator>>,
}

impl DeliveryQueue {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            accelerator: None,
        }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn QueueAccelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Mirror a newly dispatchable record into the accelerator. Best-effort.
    pub async fn offer(&self, record: &NotificationRecord) {
        if let Some(accelerator) = &self.accelerator
            && let Err(e) = accelerator.enqueue(record).await
        {
            tracing::warn!(
                notification_id = %record.id,
                error = %e,
                "Queue accelerator enqueue failed; store remains authoritative"
            );
        }
    }

    /// Drop a record from the accelerator once it is no longer dispatchable.
    pub async fn forget(&self, id: Uuid) {
        self.forget_all(&[id]).await;
    }

    async fn forget_all(&self, ids: &[Uuid]) {
        if let Some(accelerator) = &self.accelerator
            && let Err(e) = accelerator.remove(ids).await
        {
            tracing::debug!(count = ids.len(), error = %e, "Queue accelerator remove failed");
        }
    }

    /// Claim up to `limit` records, returned in dispatch order.
    ///
    /// The store's ordered claim decides what is taken. Records that never
    /// reached the mirror are therefore claimed in their proper place.
    pub async fn claim(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = self.store.claim_batch(limit, now).await?;
        if !claimed.is_empty() {
            let ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
            self.forget_all(&ids).await;
        }
        Ok(claimed)
    }
}
