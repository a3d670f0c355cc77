//! Composition root for job execution.
//!
//! [`JobOrchestrator`] owns the resolved task catalog, the job registry and
//! the artifact collector. Starting a task validates it, creates the job
//! record, and hands the run to a tracked background task; the caller gets
//! the `queued` record back immediately.
//!
//! Background lifecycle per job:
//! 1. Mark `running`.
//! 2. Create the job's output directory.
//! 3. Run the process under the effective timeout.
//! 4. Collect artifacts (best effort). Strays in a working directory shared
//!    with another run in the same span are left to no one.
//! 5. Record the terminal state, output tails and artifacts in one update.
//!
//! Nothing a job does is propagated back into the orchestrator; failures end
//! up in the job record.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

use crate::artifacts::{self, ArtifactCollector, StrayLedger};
use crate::config::OrchestratorConfig;
use crate::error::CoreError;
use crate::job::{JobRecord, JobStatus, RunParams};
use crate::registry::{JobCompletion, JobFilter, JobRegistry};
use crate::runner::{self, RunRequest};
use crate::tasks::{ArgContext, ResolvedTask, TaskCatalog, TaskDefinition, TaskSummary};
use crate::types::JobId;

/// Starts tasks as background jobs and answers queries about them.
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    catalog: RwLock<Arc<TaskCatalog>>,
    registry: JobRegistry,
    collector: ArtifactCollector,
    strays: Arc<StrayLedger>,
    tracker: TaskTracker,
}

/// Everything a background job needs, computed before it is spawned.
#[derive(Debug, Clone)]
struct JobPlan {
    job_id: JobId,
    task_id: String,
    output_dir: PathBuf,
    working_dir: PathBuf,
    request: RunRequest,
}

impl JobOrchestrator {
    /// Prepare the artifact root and resolve `definitions` under the search root.
    pub async fn start(
        mut config: OrchestratorConfig,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Self, CoreError> {
        tokio::fs::create_dir_all(&config.artifact_root)
            .await
            .map_err(|e| {
                CoreError::Config(format!(
                    "Cannot create artifact root {}: {e}",
                    config.artifact_root.display()
                ))
            })?;
        config.artifact_root = tokio::fs::canonicalize(&config.artifact_root)
            .await
            .map_err(|e| CoreError::Config(format!("Artifact root unavailable: {e}")))?;
        config.search_root = absolute(&config.search_root);

        let catalog = resolve_catalog(definitions, config.search_root.clone()).await?;
        let available = catalog.summaries().iter().filter(|t| t.available).count();
        tracing::info!(
            search_root = %config.search_root.display(),
            artifact_root = %config.artifact_root.display(),
            tasks = catalog.summaries().len(),
            available,
            "Job orchestrator ready",
        );

        Ok(Self {
            collector: ArtifactCollector::new(&config.artifact_root),
            catalog: RwLock::new(Arc::new(catalog)),
            registry: JobRegistry::in_memory(),
            strays: Arc::new(StrayLedger::new()),
            tracker: TaskTracker::new(),
            config,
        })
    }

    /// Use `registry` instead of the default in-memory one.
    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Canonical path of the shared artifact root.
    pub fn artifact_root(&self) -> &Path {
        &self.config.artifact_root
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn catalog(&self) -> Arc<TaskCatalog> {
        Arc::clone(&*self.catalog.read().await)
    }

    pub async fn task_summaries(&self) -> Vec<TaskSummary> {
        self.catalog().await.summaries()
    }

    /// Re-run script resolution for every task and swap in the result.
    ///
    /// Jobs already started keep the paths they were planned with.
    pub async fn refresh_tasks(&self) -> Result<Vec<TaskSummary>, CoreError> {
        let definitions = self.catalog().await.definitions();
        let catalog = resolve_catalog(definitions, self.config.search_root.clone()).await?;
        let summaries = catalog.summaries();
        *self.catalog.write().await = Arc::new(catalog);
        tracing::info!(
            available = summaries.iter().filter(|t| t.available).count(),
            "Task catalog refreshed",
        );
        Ok(summaries)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Create a job for `task_id` and run it in the background.
    ///
    /// Fails without creating a job when the task is unknown or its script
    /// was not found.
    pub async fn start_task(
        &self,
        task_id: &str,
        params: RunParams,
    ) -> Result<JobRecord, CoreError> {
        let catalog = self.catalog().await;
        let task = catalog
            .get(task_id)
            .ok_or_else(|| CoreError::UnknownTask(task_id.to_string()))?;
        let (Some(script), Some(working_dir)) = (&task.script, &task.working_dir) else {
            return Err(CoreError::TaskUnavailable(format!(
                "No script found for task '{task_id}'"
            )));
        };

        let job = self.registry.create(task_id, params).await?;
        let plan = self.plan(task, script, working_dir, &job);

        tracing::info!(
            job_id = %job.job_id,
            task_id,
            script = %script.display(),
            timeout_secs = plan.request.timeout.as_secs(),
            "Job queued",
        );
        self.tracker.spawn(run_job(
            self.registry.clone(),
            self.collector.clone(),
            Arc::clone(&self.strays),
            plan,
        ));
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        self.registry.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.registry.list(filter).await
    }

    /// Map a relative artifact path to a file under the artifact root.
    pub fn resolve_artifact(&self, relative: &str) -> Result<PathBuf, CoreError> {
        artifacts::resolve_artifact(&self.config.artifact_root, relative)
    }

    /// Number of jobs whose background task has not finished.
    pub fn active_jobs(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for running jobs. Returns `true` if all finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for running jobs");
        }
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        drained
    }

    fn plan(
        &self,
        task: &ResolvedTask,
        script: &Path,
        working_dir: &Path,
        job: &JobRecord,
    ) -> JobPlan {
        let definition = &task.definition;
        let output_dir = self.collector.job_dir(&job.job_id);

        let mut args = Vec::new();
        let program = match &definition.interpreter {
            Some(interpreter) => {
                args.push(script.to_string_lossy().into_owned());
                PathBuf::from(interpreter)
            }
            None => script.to_path_buf(),
        };
        args.extend(definition.args.build(ArgContext {
            output_dir: &output_dir,
            params: &job.params,
        }));

        let timeout = definition
            .timeout
            .map_or(self.config.job_timeout, |cap| cap.min(self.config.job_timeout));

        let mut env = vec![
            (
                "TID_OUTPUT_DIR".to_string(),
                output_dir.to_string_lossy().into_owned(),
            ),
            ("TID_JOB_ID".to_string(), job.job_id.clone()),
            ("PYTHONPATH".to_string(), python_path(working_dir)),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];
        if let Some(secs) = job.params.duration_secs {
            env.push(("TID_DURATION_SECS".to_string(), secs.to_string()));
        }
        if job.params.verbose {
            env.push(("TID_VERBOSE".to_string(), "1".to_string()));
        }

        JobPlan {
            job_id: job.job_id.clone(),
            task_id: job.task_id.clone(),
            output_dir,
            working_dir: working_dir.to_path_buf(),
            request: RunRequest {
                program,
                args,
                working_dir: working_dir.to_path_buf(),
                env,
                timeout,
                tail_bytes: self.config.tail_bytes,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Background job
// ---------------------------------------------------------------------------

async fn run_job(
    registry: JobRegistry,
    collector: ArtifactCollector,
    strays: Arc<StrayLedger>,
    plan: JobPlan,
) {
    let job_id = plan.job_id.as_str();
    if let Err(e) = registry.mark_running(job_id).await {
        tracing::error!(job_id, error = %e, "Failed to mark job running");
        return;
    }
    let started = SystemTime::now();
    strays.open(&plan.working_dir, job_id, started).await;

    let mut completion = match tokio::fs::create_dir_all(&plan.output_dir).await {
        Ok(()) => execute(&plan).await,
        Err(e) => JobCompletion::error(format!(
            "Cannot create output directory {}: {e}",
            plan.output_dir.display()
        )),
    };

    let contested = strays.close(&plan.working_dir, job_id, SystemTime::now()).await;
    let output_dir = plan.output_dir.clone();
    let fallback_dir = plan.working_dir.clone();
    completion.artifacts = tokio::task::spawn_blocking(move || {
        collector.collect(&output_dir, &fallback_dir, Some(started), &contested)
    })
    .await
    .unwrap_or_else(|e| {
        tracing::warn!(job_id, error = %e, "Artifact collection task failed");
        Vec::new()
    });

    let status = completion.status;
    let exit_code = completion.exit_code;
    let artifacts = completion.artifacts.len();
    match registry.finish(job_id, completion).await {
        Ok(_) if status == JobStatus::Completed => tracing::info!(
            job_id,
            task_id = %plan.task_id,
            artifacts,
            "Job completed",
        ),
        Ok(record) if status == JobStatus::Error => tracing::error!(
            job_id,
            task_id = %plan.task_id,
            error = record.error.as_deref().unwrap_or_default(),
            "Job could not be launched",
        ),
        Ok(record) => tracing::warn!(
            job_id,
            task_id = %plan.task_id,
            %status,
            exit_code,
            error = record.error.as_deref().unwrap_or_default(),
            "Job did not complete",
        ),
        Err(e) => tracing::error!(job_id, error = %e, "Failed to record job outcome"),
    }
}

/// Run the process and translate the result into a terminal completion.
async fn execute(plan: &JobPlan) -> JobCompletion {
    let timeout = plan.request.timeout;
    match runner::run(plan.request.clone()).await {
        Ok(outcome) => {
            let status = outcome.job_status();
            let error = match status {
                JobStatus::Timeout => Some(format!(
                    "Job exceeded maximum allowed runtime of {timeout:?}"
                )),
                JobStatus::Failed => Some(match outcome.exit_code {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process was terminated by a signal".to_string(),
                }),
                _ => None,
            };
            tracing::debug!(
                job_id = %plan.job_id,
                duration_ms = outcome.duration_ms,
                exit_code = outcome.exit_code,
                timed_out = outcome.timed_out,
                "Process finished",
            );
            JobCompletion {
                status,
                exit_code: outcome.exit_code,
                stdout: outcome.stdout_tail,
                stderr: outcome.stderr_tail,
                artifacts: Vec::new(),
                error,
            }
        }
        Err(e) => JobCompletion::error(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn resolve_catalog(
    definitions: Vec<TaskDefinition>,
    search_root: PathBuf,
) -> Result<TaskCatalog, CoreError> {
    tokio::task::spawn_blocking(move || TaskCatalog::resolve(definitions, &search_root))
        .await
        .map_err(|e| CoreError::Internal(format!("Task resolution failed: {e}")))
}

/// `working_dir` followed by any inherited `PYTHONPATH` entries.
fn python_path(working_dir: &Path) -> String {
    let mut entries = vec![working_dir.to_path_buf()];
    if let Some(inherited) = std::env::var_os("PYTHONPATH") {
        entries.extend(std::env::split_paths(&inherited));
    }
    std::env::join_paths(entries)
        .unwrap_or_else(|_| OsString::from(working_dir.as_os_str()))
        .to_string_lossy()
        .into_owned()
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
