//! Durable record of every notification and its lifecycle state.
//!
//! Every mutation after insert is a conditional transition: a claim only
//! succeeds on a dispatchable record, and an attempt outcome only applies to
//! a record still in `processing`. Two dispatchers racing on one record
//! therefore produce exactly one winner without any in-process lock.

pub mod memory;
pub mod postgres;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use examhub_common::error::AppError;
use examhub_common::types::{FailureClass, NotificationRecord};

/// Reason recorded when a `processing` claim outlives its owner.
pub const STALE_CLAIM_REASON: &str = "delivery outcome unknown: claim expired";

/// Outcome of one delivery attempt, applied to a claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent { provider_message_id: String },
    Failed { class: FailureClass, reason: String },
}

/// Raw counts by status, as returned by [`NotificationStore::aggregate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct StatusCounts {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub retrying: i64,
    pub sent: i64,
    pub failed: i64,
    /// Records created at or after the `since` bound.
    pub today: i64,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError>;

    /// Atomically move up to `limit` dispatchable records to `processing`,
    /// choosing by priority score descending, then `created_at` ascending.
    async fn claim_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    /// Claim one record if it is still dispatchable. `None` means someone else
    /// holds it or it is no longer eligible.
    async fn try_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Apply an attempt outcome to a record this caller claimed.
    ///
    /// Consumes one attempt. Fails with `Conflict` if the record is not in
    /// `processing`.
    async fn update_status(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<NotificationRecord, AppError>;

    /// Move `failed` records whose backoff has elapsed back to `retrying`.
    async fn promote_retryable(
        &self,
        now: DateTime<Utc>,
        retry_delay: chrono::Duration,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    /// Resolve `processing` claims taken before `claimed_before` as transient
    /// failures of one attempt each.
    async fn recover_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    /// Most recently created records for `recipient`, newest first.
    async fn find_by_recipient(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    async fn aggregate(&self, since: DateTime<Utc>) -> Result<StatusCounts, AppError>;
}
