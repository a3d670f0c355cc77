use axum::routing::get;
use axum::Router;

use crate::handlers::artifacts;
use crate::state::AppState;

/// Routes mounted at `/artifacts`.
///
/// ```text
/// GET    /{*path}         -> get_artifact
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/{*path}", get(artifacts::get_artifact))
}
