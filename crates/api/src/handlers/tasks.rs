//! Handlers for the `/tasks` resource.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let tasks = state.orchestrator.task_summaries().await;
    Ok(Json(DataResponse { data: tasks }))
}

/// POST /api/v1/tasks/refresh
///
/// Re-resolve every task's script, e.g. after the demo tree was installed
/// while the service was running.
pub async fn refresh_tasks(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let tasks = state.orchestrator.refresh_tasks().await?;
    Ok(Json(DataResponse { data: tasks }))
}
