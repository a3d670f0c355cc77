//! Job registry: the single source of truth for job state.
//!
//! Storage sits behind the [`JobStore`] trait. [`MemoryJobStore`] keeps
//! records for the life of the process; a durable backend would persist
//! each record keyed by job id, keep the insertion order for listing, and
//! apply its own retention policy. [`JobRegistry`] layers id allocation and
//! the lifecycle rules of [`JobRecord::advance`] over any store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::CoreError;
use crate::job::{JobRecord, JobStatus, RunParams};
use crate::types::JobId;

/// Length of a generated job id, in hex characters.
pub const JOB_ID_LEN: usize = 8;

/// Attempts at drawing an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// A change applied to one record. An `Err` leaves the record untouched.
pub type JobMutation = Box<dyn FnOnce(&mut JobRecord) -> Result<(), CoreError> + Send>;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Keyed storage for job records.
///
/// Implementations must allow concurrent reads, serialize writes per job id,
/// and never let writes to one job wait on another.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with [`CoreError::Conflict`] if the id is taken.
    async fn insert(&self, record: JobRecord) -> Result<(), CoreError>;

    async fn get(&self, job_id: &str) -> Option<JobRecord>;

    /// All records, most recently inserted first.
    async fn list(&self) -> Vec<JobRecord>;

    /// Apply `mutation` atomically and return the updated record.
    async fn update(&self, job_id: &str, mutation: JobMutation) -> Result<JobRecord, CoreError>;
}

struct Slot {
    seq: u64,
    record: Mutex<JobRecord>,
}

/// In-process [`JobStore`]: one lock for the id map, one per record.
#[derive(Default)]
pub struct MemoryJobStore {
    slots: RwLock<HashMap<JobId, Arc<Slot>>>,
    next_seq: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, job_id: &str) -> Option<Arc<Slot>> {
        self.slots.read().await.get(job_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), CoreError> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&record.job_id) {
            return Err(CoreError::Conflict(format!(
                "Job id {} already exists",
                record.job_id
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            record.job_id.clone(),
            Arc::new(Slot {
                seq,
                record: Mutex::new(record),
            }),
        );
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Option<JobRecord> {
        let slot = self.slot(job_id).await?;
        let record = slot.record.lock().await;
        Some(record.clone())
    }

    async fn list(&self) -> Vec<JobRecord> {
        // Snapshot the slots first so no record lock is taken under the map lock.
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            let record = slot.record.lock().await.clone();
            records.push((slot.seq, record));
        }
        records.sort_by(|a, b| b.0.cmp(&a.0));
        records.into_iter().map(|(_, record)| record).collect()
    }

    async fn update(&self, job_id: &str, mutation: JobMutation) -> Result<JobRecord, CoreError> {
        let slot = self.slot(job_id).await.ok_or_else(|| CoreError::NotFound {
            entity: "Job",
            id: job_id.to_string(),
        })?;

        let mut record = slot.record.lock().await;
        let mut draft = record.clone();
        mutation(&mut draft)?;
        *record = draft;
        Ok(record.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Optional narrowing for [`JobRegistry::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.task_id.as_deref().map_or(true, |t| record.task_id == t)
    }
}

/// Everything recorded when a job reaches its terminal state.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

impl JobCompletion {
    /// A launch-side failure with no process output.
    pub fn error(note: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            artifacts: Vec::new(),
            error: Some(note.into()),
        }
    }
}

/// Job lifecycle bookkeeping over a [`JobStore`].
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    /// Allocate a fresh id and insert a `queued` record for `task_id`.
    pub async fn create(&self, task_id: &str, params: RunParams) -> Result<JobRecord, CoreError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let record = JobRecord::queued(new_job_id(), task_id, params.clone(), Utc::now());
            match self.store.insert(record.clone()).await {
                Ok(()) => {
                    tracing::debug!(job_id = %record.job_id, task_id, "Job created");
                    return Ok(record);
                }
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Internal(
            "Could not allocate an unused job id".into(),
        ))
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        self.store.get(job_id).await.ok_or_else(|| CoreError::NotFound {
            entity: "Job",
            id: job_id.to_string(),
        })
    }

    /// Records matching `filter`, most recently created first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let matching = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|record| filter.matches(record));
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub async fn update(
        &self,
        job_id: &str,
        mutation: JobMutation,
    ) -> Result<JobRecord, CoreError> {
        self.store.update(job_id, mutation).await
    }

    /// `queued -> running`.
    pub async fn mark_running(&self, job_id: &str) -> Result<JobRecord, CoreError> {
        self.update(
            job_id,
            Box::new(|record| record.advance(JobStatus::Running, Utc::now())),
        )
        .await
    }

    /// `running -> terminal`, recording output and artifacts in the same update.
    pub async fn finish(
        &self,
        job_id: &str,
        completion: JobCompletion,
    ) -> Result<JobRecord, CoreError> {
        if !completion.status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "'{}' is not a terminal status",
                completion.status
            )));
        }
        self.update(
            job_id,
            Box::new(move |record| {
                record.advance(completion.status, Utc::now())?;
                record.exit_code = completion.exit_code;
                record.stdout = completion.stdout;
                record.stderr = completion.stderr;
                record.artifacts = completion.artifacts;
                record.error = completion.error;
                Ok(())
            }),
        )
        .await
    }
}

fn new_job_id() -> JobId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(JOB_ID_LEN);
    id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn completion(status: JobStatus) -> JobCompletion {
        JobCompletion {
            status,
            exit_code: Some(0),
            stdout: "done\n".into(),
            stderr: String::new(),
            artifacts: vec!["abc/plot.png".into()],
            error: None,
        }
    }

    #[tokio::test]
    async fn create_inserts_queued_record() {
        let registry = JobRegistry::in_memory();
        let job = registry.create("korea", RunParams::default()).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.task_id, "korea");
        assert_eq!(job.job_id.len(), JOB_ID_LEN);
        assert!(job.job_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(registry.get(&job.job_id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = JobRegistry::in_memory();
        let mut ids = Vec::new();
        for _ in 0..200 {
            ids.push(registry.create("korea", RunParams::default()).await.unwrap().job_id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = JobRegistry::in_memory();
        assert_matches!(
            registry.get("deadbeef").await,
            Err(CoreError::NotFound { entity: "Job", .. })
        );
        assert_matches!(
            registry.mark_running("deadbeef").await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn store_rejects_duplicate_insert() {
        let store = MemoryJobStore::new();
        let record =
            JobRecord::queued("aaaa0000".into(), "korea", RunParams::default(), Utc::now());
        store.insert(record.clone()).await.unwrap();
        assert_matches!(store.insert(record).await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let registry = JobRegistry::in_memory();
        let first = registry.create("a", RunParams::default()).await.unwrap();
        let second = registry.create("b", RunParams::default()).await.unwrap();
        let third = registry.create("c", RunParams::default()).await.unwrap();

        let ids: Vec<_> = registry
            .list(&JobFilter::default())
            .await
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec![third.job_id, second.job_id, first.job_id]);
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let registry = JobRegistry::in_memory();
        let a = registry.create("korea", RunParams::default()).await.unwrap();
        registry.create("vandenberg", RunParams::default()).await.unwrap();
        let c = registry.create("korea", RunParams::default()).await.unwrap();
        registry.mark_running(&a.job_id).await.unwrap();

        let by_task = registry
            .list(&JobFilter {
                task_id: Some("korea".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_task.len(), 2);

        let running = registry
            .list(&JobFilter {
                status: Some(JobStatus::Running),
                ..Default::default()
            })
            .await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, a.job_id);

        let limited = registry
            .list(&JobFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].job_id, c.job_id);
    }

    #[tokio::test]
    async fn finish_records_outcome_and_artifacts_together() {
        let registry = JobRegistry::in_memory();
        let job = registry.create("korea", RunParams::default()).await.unwrap();

        let running = registry.mark_running(&job.job_id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.artifacts.is_empty());

        let done = registry
            .finish(&job.job_id, completion(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.artifacts, vec!["abc/plot.png"]);
        assert!(done.started_at.unwrap() <= done.finished_at.unwrap());
    }

    #[tokio::test]
    async fn finish_twice_is_rejected_and_keeps_first_outcome() {
        let registry = JobRegistry::in_memory();
        let job = registry.create("korea", RunParams::default()).await.unwrap();
        registry.mark_running(&job.job_id).await.unwrap();
        registry
            .finish(&job.job_id, completion(JobStatus::Timeout))
            .await
            .unwrap();

        let err = registry
            .finish(&job.job_id, JobCompletion::error("late"))
            .await
            .unwrap_err();
        assert_matches!(err, CoreError::InvalidTransition { .. });

        let stored = registry.get(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Timeout);
        assert_eq!(stored.error, None);
    }

    #[tokio::test]
    async fn finish_requires_terminal_status() {
        let registry = JobRegistry::in_memory();
        let job = registry.create("korea", RunParams::default()).await.unwrap();
        assert_matches!(
            registry.finish(&job.job_id, completion(JobStatus::Running)).await,
            Err(CoreError::Validation(_))
        );
    }

    #[tokio::test]
    async fn failed_mutation_leaves_record_untouched() {
        let registry = JobRegistry::in_memory();
        let job = registry.create("korea", RunParams::default()).await.unwrap();

        let result = registry
            .update(
                &job.job_id,
                Box::new(|record| {
                    record.stdout = "partial".into();
                    Err(CoreError::Internal("boom".into()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get(&job.job_id).await.unwrap().stdout, "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_on_different_jobs() {
        let registry = JobRegistry::in_memory();
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let job = registry.create("korea", RunParams::default()).await.unwrap();
                registry.mark_running(&job.job_id).await.unwrap();
                let completion = JobCompletion {
                    status: if i % 2 == 0 { JobStatus::Completed } else { JobStatus::Failed },
                    exit_code: Some(i % 2),
                    stdout: format!("job {i}"),
                    stderr: String::new(),
                    artifacts: Vec::new(),
                    error: None,
                };
                registry.finish(&job.job_id, completion).await.unwrap();
                (job.job_id, i)
            }));
        }

        for handle in handles {
            let (job_id, i) = handle.await.unwrap();
            let record = registry.get(&job_id).await.unwrap();
            assert_eq!(record.stdout, format!("job {i}"));
            assert_eq!(record.exit_code, Some(i % 2));
            assert!(record.status.is_terminal());
        }
        assert_eq!(registry.list(&JobFilter::default()).await.len(), 32);
    }
}
