// --------------------------------------------------
// Focus window and plant planning endpoints.
//
// Responsibilities:
// - Tasks of the focus window, grouped by day
// - Moving the focus (prefetch + notification sync)
// - Generating a plant's task plan
// --------------------------------------------------

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use grow_scheduler::{Engine, EngineError};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// Map engine failures to HTTP statuses.
pub fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        EngineError::Validation { .. } => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        EngineError::TransientStore { .. } => {
            warn!(error = %e, "store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
        EngineError::ConfigurationGap { .. } | EngineError::NotificationSink { .. } => {
            warn!(error = %e, "engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid date").into_response())
}

#[derive(Debug, Deserialize)]
pub struct FocusQuery {
    pub date: String, // "YYYY-MM-DD"
}

// -----------------------------
// GET /api/focus
// Tasks of the window centred on `date`
// -----------------------------
pub async fn get_focus(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<FocusQuery>,
) -> impl IntoResponse {
    let date = match parse_date(&q.date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    match engine.focus_window_tasks(date).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FocusInput {
    pub date: String, // "YYYY-MM-DD"
}

// -----------------------------
// POST /api/focus
// Moves the focus window and syncs notifications
// -----------------------------
pub async fn update_focus(
    State(engine): State<Arc<Engine>>,
    Json(input): Json<FocusInput>,
) -> impl IntoResponse {
    let date = match parse_date(&input.date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    match engine.update_focus(date).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub horizon_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub plant_id: Uuid,
    pub created: usize,
    pub tasks: Vec<grow_scheduler::models::Task>,
}

// -----------------------------
// POST /api/plants/:id/schedule
// Generates stage tasks and recurrences for one plant
// -----------------------------
pub async fn schedule_plant(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(q): Query<ScheduleQuery>,
) -> impl IntoResponse {
    let plant_id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid plant id").into_response(),
    };
    if q.horizon_days == Some(0) {
        return (StatusCode::BAD_REQUEST, "horizon_days must be at least 1").into_response();
    }

    match engine.schedule_for_plant(plant_id, q.horizon_days).await {
        Ok(tasks) => Json(ScheduleResponse {
            plant_id,
            created: tasks.len(),
            tasks,
        })
        .into_response(),
        Err(e) => engine_error(e),
    }
}
