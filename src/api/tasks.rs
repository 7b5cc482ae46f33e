//! Encoder task endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
};

use crate::AppState;
use crate::api::ApiError;
use crate::media::Fingerprint;
use crate::services::encoder::{EncoderStats, TaskInfo};

/// Running encoder tasks, oldest first
async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskInfo>> {
    Json(state.encoder.list())
}

async fn task_stats(State(state): State<AppState>) -> Json<EncoderStats> {
    Json(state.encoder.stats())
}

/// Request termination of a running task
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = Fingerprint::parse(&id).ok_or(ApiError::NotFound)?;
    if state.encoder.cancel(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/{id}", delete(cancel_task))
}
