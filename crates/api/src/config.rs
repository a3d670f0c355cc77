use tid_core::config::{parse_var, OrchestratorConfig};
use tid_core::error::CoreError;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `5000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for running jobs, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Job orchestration settings.
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `5000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    ///
    /// Orchestrator variables are documented on [`OrchestratorConfig::from_env`].
    pub fn from_env() -> Result<Self, CoreError> {
        let lookup = |key: &str| std::env::var(key).ok();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_var(&lookup, "PORT", 5000)?;

        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 30)?;
        let shutdown_timeout_secs: u64 = parse_var(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?;

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            orchestrator: OrchestratorConfig::from_lookup(lookup)?,
        })
    }
}
