// --------------------------------------------------
// Notification feed endpoints.
//
// Read/unread changes go through the optimistic synchronizer, so every
// cached view of the feed is updated (or rolled back) together.
// --------------------------------------------------

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use grow_scheduler::sink::NotificationId;
use grow_scheduler::store::ReadFilter;
use grow_scheduler::Engine;
use serde::Deserialize;
use uuid::Uuid;

use crate::routes_plan::engine_error;

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub cursor: Option<usize>,
    pub page_size: Option<usize>,
    pub read: Option<ReadFilter>,
}

// -----------------------------
// GET /api/notifications
// One page of the feed, newest first
// -----------------------------
pub async fn get_notifications(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<FeedQuery>,
) -> impl IntoResponse {
    let page_size = q.page_size.unwrap_or(20);
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return (StatusCode::BAD_REQUEST, "page_size must be 1..=100").into_response();
    }

    match engine
        .load_notifications(q.cursor, page_size, q.read.unwrap_or(ReadFilter::All))
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadInput {
    pub is_read: bool,
}

// -----------------------------
// POST /api/notifications/:id/read
// -----------------------------
pub async fn mark_read(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(input): Json<ReadInput>,
) -> impl IntoResponse {
    let id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid id").into_response(),
    };

    match engine.mark_read(id, input.is_read).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(e),
    }
}

// -----------------------------
// POST /api/notifications/read-all
// -----------------------------
pub async fn mark_all_read(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.mark_all_read().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveredInput {
    pub id: NotificationId,
}

// -----------------------------
// POST /api/deliveries
// Reported by the OS side when a notification fired
// -----------------------------
pub async fn mark_delivered(
    State(engine): State<Arc<Engine>>,
    Json(input): Json<DeliveredInput>,
) -> impl IntoResponse {
    if engine.mark_delivered(&input.id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "no scheduled notification with that id").into_response()
    }
}
