//! Handlers for the `/jobs` resource.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tid_core::job::RunParams;
use tid_core::registry::JobFilter;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for starting a job.
#[derive(Debug, Deserialize)]
pub struct StartJob {
    pub task_id: String,
    #[serde(default)]
    pub params: RunParams,
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Start a task in the background. Returns 202 with the `queued` job; poll
/// `GET /api/v1/jobs/{id}` for progress. A malformed body is a 400.
pub async fn start_job(
    State(state): State<AppState>,
    body: Result<Json<StartJob>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = body?;
    let job = state
        .orchestrator
        .start_task(&input.task_id, input.params)
        .await?;

    tracing::info!(job_id = %job.job_id, task_id = %job.task_id, "Job accepted");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Most recent first. Supports optional `status`, `task_id` and `limit`
/// query parameters; an unparseable one is a 400.
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<JobFilter>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(filter) = query?;
    let jobs = state.orchestrator.list_jobs(&filter).await;
    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.get_job(&job_id).await?;
    Ok(Json(DataResponse { data: job }))
}
