use axum::routing::{get, post};
use axum::Router;

use crate::handlers::tasks;
use crate::state::AppState;

/// Routes mounted at `/tasks`.
///
/// ```text
/// GET    /                -> list_tasks
/// POST   /refresh         -> refresh_tasks
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(tasks::list_tasks))
        .route("/refresh", post(tasks::refresh_tasks))
}
