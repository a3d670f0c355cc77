pub mod artifacts;
pub mod health;
pub mod jobs;
pub mod tasks;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /tasks                   list tasks and their resolution status
/// /tasks/refresh           re-resolve task scripts (POST)
///
/// /jobs                    list, start
/// /jobs/{id}               get
///
/// /artifacts/{*path}       raw artifact bytes
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::router())
        .nest("/jobs", jobs::router())
        .nest("/artifacts", artifacts::router())
}
