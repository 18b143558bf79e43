//! Statistics and notification endpoints

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::engine::BatchEngine;
use crate::types::{EngineStatistics, Notification};

/// GET /api/stats - Aggregate statistics
pub async fn statistics(State(engine): State<BatchEngine>) -> Json<EngineStatistics> {
    Json(engine.get_statistics())
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub pending: Vec<Notification>,
    pub recent: Vec<Notification>,
}

/// GET /api/notifications - Pending and recently delivered notifications
pub async fn notifications(State(engine): State<BatchEngine>) -> Json<NotificationsResponse> {
    Json(NotificationsResponse {
        pending: engine.pending_notifications(),
        recent: engine.recent_notifications(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ForegroundRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ForegroundResponse {
    pub active: bool,
    pub delivered: usize,
}

/// POST /api/foreground - Mark the consumer active or inactive
pub async fn set_foreground(
    State(engine): State<BatchEngine>,
    Json(request): Json<ForegroundRequest>,
) -> Json<ForegroundResponse> {
    let delivered = engine.set_foreground(request.active);
    Json(ForegroundResponse {
        active: request.active,
        delivered,
    })
}
