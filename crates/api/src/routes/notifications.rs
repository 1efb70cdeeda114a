//! Notification submit, query and operator-trigger routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use examhub_common::error::AppError;
use examhub_common::types::{
    DeliveryState, NewNotification, NotificationKind, NotificationRecord, NotificationStats,
    NotificationStatus, Priority,
};
use examhub_engine::engine::{DispatchSummary, MAX_HISTORY_LIMIT, ReconcileSummary};

use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(submit_notification))
        .route("/api/notifications/stats", get(get_stats))
        .route("/api/notifications/process", post(process_queue))
        .route("/api/notifications/retry", post(retry_failed))
        .route("/api/notifications/history/{recipient}", get(get_history))
        .route("/api/notifications/{id}", get(get_status))
}

/// Kind and priority arrive as strings so an unknown value is a 400 with a
/// useful message rather than a generic body rejection.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub recipient: String,
    pub kind: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl SubmitRequest {
    fn into_new(self) -> Result<NewNotification, AppError> {
        let kind: NotificationKind = self.kind.parse()?;
        let priority = match self.priority.as_deref() {
            Some(raw) => raw.parse::<Priority>()?,
            None => Priority::default(),
        };
        Ok(NewNotification::new(self.recipient, kind, self.payload, priority))
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: NotificationStatus,
    pub delivery_state: DeliveryState,
}

/// A record plus its derived delivery state.
#[derive(Debug, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub record: NotificationRecord,
    pub delivery_state: DeliveryState,
}

impl From<NotificationRecord> for NotificationView {
    fn from(record: NotificationRecord) -> Self {
        let delivery_state = record.delivery_state();
        Self {
            record,
            delivery_state,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

/// POST /api/notifications: submit one notification.
///
/// Urgent requests are attempted before the response is written, so the
/// returned status already reflects the delivery outcome.
async fn submit_notification(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let id = state.engine.submit(body.into_new()?).await?;
    let record = state.engine.get_status(id).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id,
            status: record.status,
            delivery_state: record.delivery_state(),
        }),
    ))
}

/// GET /api/notifications/{id}
async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationView>, AppError> {
    let record = state.engine.get_status(id).await?;
    Ok(Json(record.into()))
}

/// GET /api/notifications/history/{recipient}?limit=N, newest first.
async fn get_history(
    State(state): State<AppState>,
    Path(recipient): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<NotificationView>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }

    let records = state.engine.get_history(&recipient, limit).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<NotificationStats>, AppError> {
    Ok(Json(state.engine.get_stats().await?))
}

/// POST /api/notifications/process: run a dispatch pass now.
async fn process_queue(State(state): State<AppState>) -> Result<Json<DispatchSummary>, AppError> {
    let summary = state.engine.process_queue_now().await?;
    tracing::info!(claimed = summary.claimed, "Manual dispatch pass triggered");
    Ok(Json(summary))
}

/// POST /api/notifications/retry: run a reconciliation pass now.
async fn retry_failed(State(state): State<AppState>) -> Result<Json<ReconcileSummary>, AppError> {
    let summary = state.engine.retry_failed_now().await?;
    tracing::info!(
        recovered = summary.recovered,
        promoted = summary.promoted,
        "Manual reconciliation pass triggered"
    );
    Ok(Json(summary))
}
