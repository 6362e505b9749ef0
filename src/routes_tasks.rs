// --------------------------------------------------
// Task lifecycle endpoints.
//
// Responsibilities:
// - Complete / delete tasks (cancels their notifications)
// - Record environmental readings
// - Overdue sweep
// --------------------------------------------------

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use grow_scheduler::models::EnvironmentalReading;
use grow_scheduler::Engine;
use uuid::Uuid;

use crate::routes_plan::engine_error;

// -----------------------------
// POST /api/tasks/:id/complete
// -----------------------------
pub async fn complete_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid id").into_response(),
    };

    match engine.complete_task(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => engine_error(e),
    }
}

// -----------------------------
// DELETE /api/tasks/:id
// Logical delete, the row stays in db.json
// -----------------------------
pub async fn delete_task(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid id").into_response(),
    };

    match engine.delete_task(id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(e),
    }
}

// -----------------------------
// POST /api/readings
// Latest sensor / weather snapshot
// -----------------------------
pub async fn record_readings(
    State(engine): State<Arc<Engine>>,
    Json(reading): Json<EnvironmentalReading>,
) -> impl IntoResponse {
    match engine.record_readings(reading) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(e),
    }
}

// -----------------------------
// POST /api/overdue
// -----------------------------
pub async fn process_overdue(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.process_overdue().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => engine_error(e),
    }
}
