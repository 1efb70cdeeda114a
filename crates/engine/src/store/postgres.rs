//! PostgreSQL-backed notification store.
//!
//! Claims use `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)`,
//! so concurrent dispatchers (the scheduled pass in the worker, a manual pass
//! through the API) never select the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use examhub_common::error::AppError;
use examhub_common::types::{FailureClass, NotificationRecord};

use super::{NotificationStore, STALE_CLAIM_REASON, StatusCounts, Transition};

/// Store backed by the `notifications` table.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, recipient, kind, payload, priority, priority_score, status,
                attempt_count, max_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.recipient)
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.priority.to_string())
        .bind(record.priority.score())
        .bind(record.status.to_string())
        .bind(record.attempt_count)
        .bind(record.max_attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        let record = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn claim_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        // RETURNING order is unspecified, so the outer SELECT restores it
        let claimed: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            WITH claimed AS (
                UPDATE notifications
                SET status = 'processing', claimed_at = $1, updated_at = $1
                WHERE id IN (
                    SELECT id FROM notifications
                    WHERE status IN ('pending', 'retrying')
                      AND attempt_count < max_attempts
                    ORDER BY priority_score DESC, created_at ASC, seq ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
            )
            SELECT * FROM claimed
            ORDER BY priority_score DESC, created_at ASC, seq ASC
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let record = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'processing', claimed_at = $2, updated_at = $2
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND attempt_count < max_attempts
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_status(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<NotificationRecord, AppError> {
        let updated: Option<NotificationRecord> = match transition {
            Transition::Sent {
                provider_message_id,
            } => {
                sqlx::query_as(
                    r#"
                    UPDATE notifications
                    SET status = 'sent',
                        attempt_count = LEAST(attempt_count + 1, max_attempts),
                        last_attempt_at = $3,
                        sent_at = $3,
                        provider_message_id = $2,
                        failure_class = NULL,
                        failure_reason = NULL,
                        claimed_at = NULL,
                        updated_at = $3
                    WHERE id = $1 AND status = 'processing'
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(provider_message_id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Failed { class, reason } => {
                sqlx::query_as(
                    r#"
                    UPDATE notifications
                    SET status = 'failed',
                        attempt_count = LEAST(attempt_count + 1, max_attempts),
                        last_attempt_at = $4,
                        failure_class = $2,
                        failure_reason = $3,
                        claimed_at = NULL,
                        updated_at = $4
                    WHERE id = $1 AND status = 'processing'
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(class.to_string())
                .bind(reason)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        updated.ok_or_else(|| {
            AppError::Conflict(format!(
                "Notification {} is not claimed for processing",
                id
            ))
        })
    }

    async fn promote_retryable(
        &self,
        now: DateTime<Utc>,
        retry_delay: chrono::Duration,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        // Mirrors NotificationRecord::retry_eligible_at
        let promoted = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'retrying', updated_at = $1
            WHERE status = 'failed'
              AND attempt_count < max_attempts
              AND failure_class IS DISTINCT FROM $3
              AND (last_attempt_at IS NULL OR last_attempt_at <= $2)
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(
            now.checked_sub_signed(retry_delay)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
        .bind(FailureClass::Permanent.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(promoted)
    }

    async fn recover_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let recovered = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'failed',
                attempt_count = LEAST(attempt_count + 1, max_attempts),
                last_attempt_at = claimed_at,
                failure_class = $3,
                failure_reason = $4,
                claimed_at = NULL,
                updated_at = $2
            WHERE status = 'processing' AND claimed_at < $1
            RETURNING *
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(FailureClass::Transient.to_string())
        .bind(STALE_CLAIM_REASON)
        .fetch_all(&self.pool)
        .await?;

        Ok(recovered)
    }

    async fn find_by_recipient(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let records = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE recipient = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(recipient)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn aggregate(&self, since: DateTime<Utc>) -> Result<StatusCounts, AppError> {
        let counts = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'retrying') AS retrying,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE created_at >= $1) AS today
            FROM notifications
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }
}
