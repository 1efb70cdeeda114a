use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// The closed set of notifications the platform knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
pub enum NotificationKind {
    VerificationCode,
    Welcome,
    CredentialIssue,
    PasswordReset,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 4] = [
        NotificationKind::VerificationCode,
        NotificationKind::Welcome,
        NotificationKind::CredentialIssue,
        NotificationKind::PasswordReset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::VerificationCode => "verification-code",
            NotificationKind::Welcome => "welcome",
            NotificationKind::CredentialIssue => "credential-issue",
            NotificationKind::PasswordReset => "password-reset",
        }
    }

    /// Payload keys the renderer cannot do without.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            NotificationKind::VerificationCode => &["code"],
            NotificationKind::Welcome => &[],
            NotificationKind::CredentialIssue => &["username", "password"],
            NotificationKind::PasswordReset => &[],
        }
    }

    /// Check that `payload` is an object carrying every required field.
    ///
    /// Required fields must be non-empty strings or numbers.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), AppError> {
        let object = payload.as_object().ok_or_else(|| {
            AppError::Validation(format!(
                "Payload for '{}' must be a JSON object",
                self.as_str()
            ))
        })?;

        for field in self.required_fields() {
            let present = match object.get(*field) {
                Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
                Some(serde_json::Value::Number(_)) => true,
                _ => false,
            };
            if !present {
                return Err(AppError::Validation(format!(
                    "Payload for '{}' is missing required field '{}'",
                    self.as_str(),
                    field
                )));
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Unknown notification kind '{}'. Valid kinds: {}",
                    s,
                    Self::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}

/// Coarse dispatch priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Ordering score. Only used to order dispatch, never to bypass attempt limits.
    pub fn score(&self) -> i32 {
        match self {
            Priority::Low => 25,
            Priority::Normal => 50,
            Priority::High => 75,
            Priority::Urgent => 100,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(AppError::Validation(format!(
                "Unknown priority '{}'. Valid priorities: low, normal, high, urgent",
                other
            ))),
        }
    }
}

/// Persisted lifecycle status.
///
/// `Processing` is the interim claim marker: a record only enters it through a
/// conditional transition that exactly one dispatcher can win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Retrying,
    Sent,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Retrying => write!(f, "retrying"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How the last delivery failure was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Where a record stands, derived from its persisted fields.
///
/// Splits the single `failed` status into "will be retried" and the two
/// terminal reasons, so every consumer reads the same retry predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting for a dispatch pass (`pending` or `retrying`).
    Queued,
    /// Claimed by a dispatcher; an attempt is in progress.
    InFlight,
    /// Failed transiently with attempts left; the reconciliation pass will requeue it.
    AwaitingRetry,
    Delivered,
    /// Every allowed attempt failed.
    Exhausted,
    /// The provider refused the message; retrying cannot help.
    Rejected,
}

/// A request to deliver one message to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

impl NewNotification {
    pub fn new(
        recipient: impl Into<String>,
        kind: NotificationKind,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            kind,
            payload,
            priority,
        }
    }
}

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub failure_class: Option<FailureClass>,
    pub failure_reason: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Build a fresh `pending` record with no attempts consumed.
    pub fn new(id: Uuid, request: NewNotification, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            recipient: request.recipient,
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            status: NotificationStatus::Pending,
            attempt_count: 0,
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX).max(1),
            failure_class: None,
            failure_reason: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            sent_at: None,
            claimed_at: None,
        }
    }

    pub fn delivery_state(&self) -> DeliveryState {
        match self.status {
            NotificationStatus::Pending | NotificationStatus::Retrying => DeliveryState::Queued,
            NotificationStatus::Processing => DeliveryState::InFlight,
            NotificationStatus::Sent => DeliveryState::Delivered,
            NotificationStatus::Failed => {
                if self.failure_class == Some(FailureClass::Permanent) {
                    DeliveryState::Rejected
                } else if self.attempt_count >= self.max_attempts {
                    DeliveryState::Exhausted
                } else {
                    DeliveryState::AwaitingRetry
                }
            }
        }
    }

    /// Whether a dispatch pass may claim this record.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self.status,
            NotificationStatus::Pending | NotificationStatus::Retrying
        ) && self.attempt_count < self.max_attempts
    }

    /// Earliest instant the reconciliation pass may requeue this record.
    ///
    /// `None` unless the record is awaiting a retry. A record that never
    /// recorded an attempt time is eligible immediately.
    pub fn retry_eligible_at(&self, retry_delay: chrono::Duration) -> Option<DateTime<Utc>> {
        if self.delivery_state() != DeliveryState::AwaitingRetry {
            return None;
        }
        Some(self.last_attempt_at.map_or(self.updated_at, |last| {
            last.checked_add_signed(retry_delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        }))
    }
}

/// Aggregate view returned by GetStats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total: i64,
    pub sent: i64,
    /// `pending` + `processing` + `retrying`.
    pub pending: i64,
    pub failed: i64,
    /// Created since midnight UTC.
    pub today: i64,
    /// `sent / total` as a percentage, two decimals.
    pub success_rate: f64,
}

/// Outcome event emitted after a terminal delivery result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// `notification.sent` or `notification.failed`
    pub event: String,
    pub notification_id: Uuid,
    pub recipient: String,
    pub kind: NotificationKind,
    pub attempt_count: i32,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryEvent {
    pub const SENT: &'static str = "notification.sent";
    pub const FAILED: &'static str = "notification.failed";

    pub fn from_record(record: &NotificationRecord, occurred_at: DateTime<Utc>) -> Self {
        let event = if record.status == NotificationStatus::Sent {
            Self::SENT
        } else {
            Self::FAILED
        };
        Self {
            event: event.to_string(),
            notification_id: record.id,
            recipient: record.recipient.clone(),
            kind: record.kind,
            attempt_count: record.attempt_count,
            provider_message_id: record.provider_message_id.clone(),
            failure_reason: record.failure_reason.clone(),
            occurred_at,
        }
    }
}
