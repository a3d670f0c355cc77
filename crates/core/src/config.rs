use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::runner::DEFAULT_TAIL_BYTES;

/// Orchestrator settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory tree searched for task scripts.
    pub search_root: PathBuf,
    /// Shared artifact root; each job gets `{artifact_root}/{job_id}`.
    pub artifact_root: PathBuf,
    /// Upper bound on any job's run time.
    pub job_timeout: Duration,
    /// Bytes of stdout/stderr retained per stream.
    pub tail_bytes: usize,
    /// Interpreter for the demo scripts.
    pub python: String,
    /// File marking a script's project root.
    pub root_marker: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            search_root: PathBuf::from("."),
            artifact_root: PathBuf::from("output"),
            job_timeout: Duration::from_secs(600),
            tail_bytes: DEFAULT_TAIL_BYTES,
            python: "python3".into(),
            root_marker: "setup.py".into(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default    |
    /// |-------------------------|------------|
    /// | `TID_SEARCH_ROOT`       | `.`        |
    /// | `TID_ARTIFACT_ROOT`     | `output`   |
    /// | `JOB_TIMEOUT`           | `600`      |
    /// | `TID_OUTPUT_TAIL_BYTES` | `5000`     |
    /// | `TID_PYTHON`            | `python3`  |
    /// | `TID_ROOT_MARKER`       | `setup.py` |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let job_timeout_secs: u64 = parse_var(&lookup, "JOB_TIMEOUT", 600)?;
        if job_timeout_secs == 0 {
            return Err(CoreError::Config("JOB_TIMEOUT must be positive".into()));
        }
        let tail_bytes: usize = parse_var(&lookup, "TID_OUTPUT_TAIL_BYTES", defaults.tail_bytes)?;

        Ok(Self {
            search_root: lookup("TID_SEARCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.search_root),
            artifact_root: lookup("TID_ARTIFACT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_root),
            job_timeout: Duration::from_secs(job_timeout_secs),
            tail_bytes,
            python: non_empty(lookup("TID_PYTHON")).unwrap_or(defaults.python),
            root_marker: non_empty(lookup("TID_ROOT_MARKER")).unwrap_or(defaults.root_marker),
        })
    }
}

/// Parse `key` if set, else `default`.
pub fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
