//! Shared application state for the Axum API server.

use std::sync::Arc;

use examhub_engine::engine::NotificationEngine;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NotificationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<NotificationEngine>) -> Self {
        Self { engine }
    }
}
