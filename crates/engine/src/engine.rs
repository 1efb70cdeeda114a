//! Notification engine: intake, dispatch and reconciliation.
//!
//! Lifecycle of a record:
//! 1. `submit` validates and inserts it as `pending` (urgent requests are
//!    attempted inline before returning)
//! 2. a dispatch pass claims it (`processing`), calls the gateway under a
//!    timeout and records the outcome (`sent` or `failed`)
//! 3. a reconciliation pass moves transient failures whose backoff has
//!    elapsed to `retrying`, which the next dispatch pass picks up

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use examhub_common::config::EngineSettings;
use examhub_common::error::AppError;
use examhub_common::types::{
    DeliveryEvent, DeliveryState, NewNotification, NotificationRecord, NotificationStats,
    Priority,
};
use examhub_notifier::render::render;
use examhub_notifier::{DeliveryError, EmailGateway};

use crate::clock::{Clock, SystemClock, to_chrono};
use crate::queue::{DeliveryQueue, QueueAccelerator};
use crate::stats::StatsAggregator;
use crate::store::{NotificationStore, Transition};

/// Capacity of the delivery-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How far a claim must outlive the send timeout before it counts as stale.
const STALE_CLAIM_MARGIN: Duration = Duration::from_secs(1);

/// Largest page GetHistory will return.
pub const MAX_HISTORY_LIMIT: u32 = 100;

/// Whether `submit_with` attempts delivery before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Persist, then attempt once before returning.
    Inline,
    /// Persist and leave it to the next dispatch pass.
    Queued,
}

impl DispatchMode {
    /// The default mode for a priority: only urgent sends go inline.
    pub fn for_priority(priority: Priority) -> Self {
        if priority == Priority::Urgent {
            DispatchMode::Inline
        } else {
            DispatchMode::Queued
        }
    }
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub sent: usize,
    /// Failed transiently with attempts left.
    pub retry_scheduled: usize,
    /// Failed terminally (exhausted or rejected).
    pub failed: usize,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Abandoned `processing` claims resolved as failed attempts.
    pub recovered: usize,
    /// `failed` records moved back to `retrying`.
    pub promoted: usize,
}

/// Orchestrates intake, dispatch, retry policy and outcome events.
pub struct NotificationEngine {
    store: Arc<dyn NotificationStore>,
    queue: DeliveryQueue,
    gateway: Arc<dyn EmailGateway>,
    stats: StatsAggregator,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    events: broadcast::Sender<DeliveryEvent>,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn EmailGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self::with_clock(store, gateway, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn EmailGateway>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue: DeliveryQueue::new(store.clone()),
            stats: StatsAggregator::new(store.clone(), clock.clone(), settings.stats_ttl),
            store,
            gateway,
            clock,
            settings,
            events,
        }
    }

    /// Layer a read accelerator over the dispatch queue.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn QueueAccelerator>) -> Self {
        self.queue = self.queue.with_accelerator(accelerator);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Receive `notification.sent` / `notification.failed` events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Accept a notification request. Urgent requests are attempted inline.
    pub async fn submit(&self, request: NewNotification) -> Result<Uuid, AppError> {
        let mode = DispatchMode::for_priority(request.priority);
        self.submit_with(request, mode).await
    }

    /// Accept a notification request with an explicit dispatch mode.
    ///
    /// Validation failures create no record. An inline attempt never turns
    /// into an error for the caller: the outcome is in the record.
    pub async fn submit_with(
        &self,
        request: NewNotification,
        mode: DispatchMode,
    ) -> Result<Uuid, AppError> {
        if request.recipient.trim().is_empty() {
            return Err(AppError::Validation("Recipient must not be empty".to_string()));
        }
        request.kind.validate_payload(&request.payload)?;

        let now = self.clock.now();
        let record = NotificationRecord::new(Uuid::new_v4(), request, self.settings.max_attempts, now);
        self.store.insert(&record).await?;
        self.stats.invalidate().await;

        tracing::info!(
            notification_id = %record.id,
            kind = %record.kind,
            priority = %record.priority,
            inline = mode == DispatchMode::Inline,
            "Notification submitted"
        );

        match mode {
            DispatchMode::Inline => match self.store.try_claim(record.id, self.clock.now()).await {
                Ok(Some(claimed)) => {
                    if let Err(e) = self.attempt(claimed).await {
                        tracing::error!(
                            notification_id = %record.id,
                            error = %e,
                            "Inline delivery could not record its outcome"
                        );
                    }
                }
                Ok(None) => {
                    tracing::debug!(notification_id = %record.id, "Inline claim lost to a dispatch pass");
                }
                Err(e) => {
                    // Persisted already; the next dispatch pass will pick it up
                    tracing::warn!(
                        notification_id = %record.id,
                        error = %e,
                        "Inline claim failed, leaving record queued"
                    );
                }
            },
            DispatchMode::Queued => self.queue.offer(&record).await,
        }

        Ok(record.id)
    }

    /// Dispatch one configured batch (the scheduled pass and the manual trigger).
    pub async fn process_queue_now(&self) -> Result<DispatchSummary, AppError> {
        self.dispatch_batch(self.settings.batch_size).await
    }

    /// Claim up to `limit` eligible records and attempt each once, in
    /// priority-descending then FIFO order.
    ///
    /// Gateway failures become record transitions; only a failure to claim
    /// aborts the pass.
    pub async fn dispatch_batch(&self, limit: u32) -> Result<DispatchSummary, AppError> {
        let claimed = self.queue.claim(limit, self.clock.now()).await?;

        let mut summary = DispatchSummary {
            claimed: claimed.len(),
            ..Default::default()
        };

        for record in claimed {
            let id = record.id;
            match self.attempt(record).await {
                Ok(updated) => match updated.delivery_state() {
                    DeliveryState::Delivered => summary.sent += 1,
                    DeliveryState::AwaitingRetry => summary.retry_scheduled += 1,
                    DeliveryState::Exhausted | DeliveryState::Rejected => summary.failed += 1,
                    DeliveryState::Queued | DeliveryState::InFlight => {}
                },
                Err(e) => {
                    // Left in `processing`; stale-claim recovery resolves it
                    tracing::error!(
                        notification_id = %id,
                        error = %e,
                        "Failed to record delivery outcome"
                    );
                }
            }
        }

        if summary.claimed > 0 {
            tracing::info!(
                claimed = summary.claimed,
                sent = summary.sent,
                retry_scheduled = summary.retry_scheduled,
                failed = summary.failed,
                "Dispatch pass complete"
            );
        } else {
            tracing::debug!("Dispatch pass found nothing to send");
        }

        Ok(summary)
    }

    /// Run a reconciliation pass now.
    ///
    /// Resolves abandoned claims first, then requeues backed-off failures.
    pub async fn retry_failed_now(&self) -> Result<ReconcileSummary, AppError> {
        let now = self.clock.now();
        let claimed_before = now
            .checked_sub_signed(to_chrono(self.stale_claim_window()))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let recovered = self.store.recover_stale_claims(claimed_before, now).await?;
        for record in &recovered {
            tracing::warn!(
                notification_id = %record.id,
                attempt = record.attempt_count,
                "Recovered abandoned delivery claim"
            );
            if matches!(
                record.delivery_state(),
                DeliveryState::Exhausted | DeliveryState::Rejected
            ) {
                self.emit(record);
            }
        }

        let promoted = self
            .store
            .promote_retryable(now, to_chrono(self.settings.retry_delay))
            .await?;
        for record in &promoted {
            self.queue.offer(record).await;
        }

        let summary = ReconcileSummary {
            recovered: recovered.len(),
            promoted: promoted.len(),
        };

        if summary.recovered > 0 || summary.promoted > 0 {
            self.stats.invalidate().await;
            tracing::info!(
                recovered = summary.recovered,
                promoted = summary.promoted,
                "Reconciliation pass complete"
            );
        } else {
            tracing::debug!("Reconciliation pass found nothing to requeue");
        }

        Ok(summary)
    }

    /// Age at which a `processing` claim is recovered. Never shorter than a
    /// send in flight can take, whatever the configured window.
    fn stale_claim_window(&self) -> Duration {
        self.settings
            .stale_claim_after
            .max(self.settings.send_timeout.saturating_add(STALE_CLAIM_MARGIN))
    }

    /// GetStatus: the last durable state of one record.
    pub async fn get_status(&self, id: Uuid) -> Result<NotificationRecord, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    /// GetHistory: the `limit` most recent records for a recipient, newest first.
    pub async fn get_history(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        self.store
            .find_by_recipient(recipient, limit.min(MAX_HISTORY_LIMIT))
            .await
    }

    pub async fn get_stats(&self) -> Result<NotificationStats, AppError> {
        self.stats.get().await
    }

    /// Round-trip to the store, bypassing the stats cache.
    pub async fn check_store(&self) -> Result<(), AppError> {
        self.store.aggregate(self.clock.now()).await.map(|_| ())
    }

    /// One delivery attempt for a record this engine has claimed.
    async fn attempt(&self, record: NotificationRecord) -> Result<NotificationRecord, AppError> {
        let timeout = self.settings.send_timeout;

        let result = match render(&record.recipient, record.kind, &record.payload) {
            Ok(email) => match tokio::time::timeout(timeout, self.gateway.send(&email)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(timeout.as_secs())),
            },
            Err(e) => Err(e),
        };

        let transition = match result {
            Ok(receipt) => Transition::Sent {
                provider_message_id: receipt.provider_message_id,
            },
            Err(e) => Transition::Failed {
                class: e.class(),
                reason: e.to_string(),
            },
        };

        let updated = self
            .store
            .update_status(record.id, &transition, self.clock.now())
            .await?;
        self.queue.forget(updated.id).await;
        self.stats.invalidate().await;

        match updated.delivery_state() {
            DeliveryState::Delivered => {
                tracing::info!(
                    notification_id = %updated.id,
                    provider = self.gateway.name(),
                    attempt = updated.attempt_count,
                    "Notification sent"
                );
                self.emit(&updated);
            }
            DeliveryState::AwaitingRetry => {
                tracing::warn!(
                    notification_id = %updated.id,
                    attempt = updated.attempt_count,
                    max_attempts = updated.max_attempts,
                    error = updated.failure_reason.as_deref().unwrap_or_default(),
                    "Delivery failed, will retry after backoff"
                );
            }
            DeliveryState::Exhausted | DeliveryState::Rejected => {
                tracing::error!(
                    notification_id = %updated.id,
                    attempt = updated.attempt_count,
                    error = updated.failure_reason.as_deref().unwrap_or_default(),
                    "Notification failed permanently"
                );
                self.emit(&updated);
            }
            DeliveryState::Queued | DeliveryState::InFlight => {}
        }

        Ok(updated)
    }

    fn emit(&self, record: &NotificationRecord) {
        // No receivers is fine; events are advisory
        let _ = self
            .events
            .send(DeliveryEvent::from_record(record, self.clock.now()));
    }
}
