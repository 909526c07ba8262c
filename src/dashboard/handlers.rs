//! HTTP handlers for the dashboard API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::error;

use super::types::{TaskDetail, TaskSummary, TasksResponse};
use crate::AppState;

/// Handler: GET /tasks
///
/// All tasks, newest first, without log timelines.
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(tasks) => Json(TasksResponse {
            tasks: tasks.iter().map(TaskSummary::from).collect(),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to list tasks: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list tasks").into_response()
        }
    }
}

/// Handler: GET /tasks/:id
///
/// Full detail for one task, logs included.
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get(&id).await {
        Ok(Some(task)) => Json(TaskDetail::from(&task)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Task not found").into_response(),
        Err(e) => {
            error!("Failed to fetch task {}: {:#}", id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch task").into_response()
        }
    }
}
