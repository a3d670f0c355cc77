use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when any task script is missing.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Jobs still running in the background.
    pub active_jobs: usize,
    pub tasks: Vec<TaskHealth>,
}

/// Resolution status of one task.
#[derive(Serialize)]
pub struct TaskHealth {
    pub id: String,
    pub available: bool,
    pub script: Option<String>,
    pub working_dir: Option<String>,
}

/// GET /health -- returns service health and per-task script resolution.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let tasks: Vec<TaskHealth> = state
        .orchestrator
        .task_summaries()
        .await
        .into_iter()
        .map(|t| TaskHealth {
            id: t.id,
            available: t.available,
            script: t.script,
            working_dir: t.working_dir,
        })
        .collect();

    let status = if tasks.iter().all(|t| t.available) {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        active_jobs: state.orchestrator.active_jobs(),
        tasks,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
