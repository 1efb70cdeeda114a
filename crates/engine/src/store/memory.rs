//! In-process store used by tests and single-node development runs.
//!
//! All conditional transitions happen under one mutex that is never held
//! across an await, which gives the same single-winner claim semantics as the
//! PostgreSQL store.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use examhub_common::error::AppError;
use examhub_common::types::{FailureClass, NotificationRecord, NotificationStatus};

use super::{NotificationStore, STALE_CLAIM_REASON, StatusCounts, Transition};

#[derive(Debug)]
struct Entry {
    /// Insertion order, breaks ties between equal `created_at` values.
    seq: u64,
    record: NotificationRecord,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<Uuid, Entry>,
}

/// In-memory [`NotificationStore`].
#[derive(Debug)]
pub struct MemoryNotificationStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of every record, in insertion order.
    pub async fn all(&self) -> Vec<NotificationRecord> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.record.clone()).collect()
    }

    fn ensure_available(&self) -> Result<(), AppError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Database(sqlx::Error::PoolTimedOut))
        }
    }
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn claim(record: &mut NotificationRecord, now: DateTime<Utc>) {
    record.status = NotificationStatus::Processing;
    record.claimed_at = Some(now);
    record.updated_at = now;
}

/// Record a failed attempt: consume the attempt and park the record in `failed`.
fn fail(
    record: &mut NotificationRecord,
    class: FailureClass,
    reason: &str,
    attempted_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    record.status = NotificationStatus::Failed;
    record.attempt_count = (record.attempt_count + 1).min(record.max_attempts);
    record.last_attempt_at = Some(attempted_at);
    record.failure_class = Some(class);
    record.failure_reason = Some(reason.to_string());
    record.claimed_at = None;
    record.updated_at = now;
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&record.id) {
            return Err(AppError::Conflict(format!(
                "Notification {} already exists",
                record.id
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            record.id,
            Entry {
                seq,
                record: record.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&id).map(|entry| entry.record.clone()))
    }

    async fn claim_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;

        let mut candidates: Vec<(Reverse<i32>, DateTime<Utc>, u64, Uuid)> = inner
            .entries
            .values()
            .filter(|entry| entry.record.is_dispatchable())
            .map(|entry| {
                (
                    Reverse(entry.record.priority.score()),
                    entry.record.created_at,
                    entry.seq,
                    entry.record.id,
                )
            })
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, _, _, id) in candidates.into_iter().take(limit as usize) {
            if let Some(entry) = inner.entries.get_mut(&id) {
                claim(&mut entry.record, now);
                claimed.push(entry.record.clone());
            }
        }
        Ok(claimed)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.record.is_dispatchable() => {
                claim(&mut entry.record, now);
                Ok(Some(entry.record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<NotificationRecord, AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        let record = &mut entry.record;
        if record.status != NotificationStatus::Processing {
            return Err(AppError::Conflict(format!(
                "Notification {} is {}, not processing",
                id, record.status
            )));
        }

        match transition {
            Transition::Sent {
                provider_message_id,
            } => {
                record.status = NotificationStatus::Sent;
                record.attempt_count = (record.attempt_count + 1).min(record.max_attempts);
                record.last_attempt_at = Some(now);
                record.sent_at = Some(now);
                record.provider_message_id = Some(provider_message_id.clone());
                record.failure_class = None;
                record.failure_reason = None;
                record.claimed_at = None;
                record.updated_at = now;
            }
            Transition::Failed { class, reason } => fail(record, *class, reason, now, now),
        }

        Ok(record.clone())
    }

    async fn promote_retryable(
        &self,
        now: DateTime<Utc>,
        retry_delay: chrono::Duration,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;

        let mut promoted = Vec::new();
        for entry in inner.entries.values_mut() {
            let due = entry
                .record
                .retry_eligible_at(retry_delay)
                .is_some_and(|eligible_at| eligible_at <= now);
            if due {
                entry.record.status = NotificationStatus::Retrying;
                entry.record.updated_at = now;
                promoted.push((entry.seq, entry.record.clone()));
            }
        }
        promoted.sort_by_key(|(seq, _)| *seq);
        Ok(promoted.into_iter().map(|(_, record)| record).collect())
    }

    async fn recover_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let mut inner = self.inner.lock().await;

        let mut recovered = Vec::new();
        for entry in inner.entries.values_mut() {
            let record = &mut entry.record;
            if record.status != NotificationStatus::Processing {
                continue;
            }
            let Some(claimed_at) = record.claimed_at else {
                continue;
            };
            if claimed_at < claimed_before {
                fail(
                    record,
                    FailureClass::Transient,
                    STALE_CLAIM_REASON,
                    claimed_at,
                    now,
                );
                recovered.push(record.clone());
            }
        }
        Ok(recovered)
    }

    async fn find_by_recipient(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.ensure_available()?;
        let inner = self.inner.lock().await;

        let mut matches: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|entry| entry.record.recipient == recipient)
            .collect();
        matches.sort_by_key(|entry| Reverse((entry.record.created_at, entry.seq)));

        Ok(matches
            .into_iter()
            .take(limit as usize)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn aggregate(&self, since: DateTime<Utc>) -> Result<StatusCounts, AppError> {
        self.ensure_available()?;
        let inner = self.inner.lock().await;

        let mut counts = StatusCounts::default();
        for entry in inner.entries.values() {
            let record = &entry.record;
            counts.total += 1;
            match record.status {
                NotificationStatus::Pending => counts.pending += 1,
                NotificationStatus::Processing => counts.processing += 1,
                NotificationStatus::Retrying => counts.retrying += 1,
                NotificationStatus::Sent => counts.sent += 1,
                NotificationStatus::Failed => counts.failed += 1,
            }
            if record.created_at >= since {
                counts.today += 1;
            }
        }
        Ok(counts)
    }
}
