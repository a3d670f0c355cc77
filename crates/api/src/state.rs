use std::sync::Arc;

use tid_core::orchestrator::JobOrchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone; everything lives behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Task catalog, job registry and runner.
    pub orchestrator: Arc<JobOrchestrator>,
}
