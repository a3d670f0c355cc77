//! Job record and lifecycle state machine.
//!
//! ```text
//! queued ──► running ──┬──► completed   (exit status 0)
//!                      ├──► failed      (non-zero exit)
//!                      ├──► timeout     (killed at the deadline)
//!                      └──► error       (could not launch / talk to the process)
//! ```
//!
//! Every right-hand state is terminal. [`JobRecord::advance`] is the only way
//! the status field changes, so the graph above is enforced in one place.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Error,
}

impl JobStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            other => Err(CoreError::Validation(format!(
                "Unknown job status '{other}'"
            ))),
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Error
        )
    }

    /// Whether the lifecycle graph has an edge `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Queued => next == Self::Running,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Runtime parameters
// ---------------------------------------------------------------------------

/// Optional caller-supplied knobs for a single run.
///
/// Exported to every process as `TID_DURATION_SECS` and `TID_VERBOSE`; a
/// task's argument builder may also turn them into flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    /// How long a live monitor should watch before exiting, in seconds.
    pub duration_secs: Option<u64>,
    /// Ask the demo for verbose logging.
    pub verbose: bool,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One invocation of a task, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub task_id: String,
    pub status: JobStatus,
    pub params: RunParams,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Most recent bytes of the process's standard output.
    pub stdout: String,
    /// Most recent bytes of the process's standard error.
    pub stderr: String,
    /// `None` until the process exits, and when it was killed by a signal.
    pub exit_code: Option<i32>,
    /// Paths relative to the shared artifact root.
    pub artifacts: Vec<String>,
    /// Human-readable reason for a non-successful ending.
    pub error: Option<String>,
}

impl JobRecord {
    /// A fresh record in the `queued` state.
    pub fn queued(
        job_id: JobId,
        task_id: impl Into<String>,
        params: RunParams,
        now: Timestamp,
    ) -> Self {
        Self {
            job_id,
            task_id: task_id.into(),
            status: JobStatus::Queued,
            params,
            created_at: now,
            started_at: None,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            artifacts: Vec::new(),
            error: None,
        }
    }

    /// Move to `next`, stamping `started_at` / `finished_at`.
    ///
    /// Timestamps are clamped so `created_at <= started_at <= finished_at`
    /// holds even if the wall clock steps backwards.
    pub fn advance(&mut self, next: JobStatus, now: Timestamp) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }

        if next == JobStatus::Running {
            self.started_at = Some(now.max(self.created_at));
        }
        if next.is_terminal() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(now.max(floor));
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    use super::*;

    const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Error,
    ];

    fn record() -> JobRecord {
        JobRecord::queued("abcd1234".into(), "vandenberg", RunParams::default(), Utc::now())
    }

    #[test]
    fn queued_only_moves_to_running() {
        for next in ALL {
            assert_eq!(
                JobStatus::Queued.can_transition_to(next),
                next == JobStatus::Running,
                "queued -> {next}"
            );
        }
    }

    #[test]
    fn running_only_moves_to_terminal_states() {
        for next in ALL {
            assert_eq!(JobStatus::Running.can_transition_to(next), next.is_terminal());
        }
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in ALL {
                assert!(!from.can_transition_to(next), "{from} -> {next}");
            }
        }
    }

    #[test]
    fn status_names_round_trip() {
        for status in ALL {
            assert_eq!(JobStatus::from_name(status.as_str()).unwrap(), status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
        assert_matches!(JobStatus::from_name("done"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn advance_stamps_timestamps() {
        let mut job = record();
        let t1 = job.created_at + Duration::seconds(1);
        let t2 = job.created_at + Duration::seconds(5);

        job.advance(JobStatus::Running, t1).unwrap();
        assert_eq!(job.started_at, Some(t1));
        assert_eq!(job.finished_at, None);

        job.advance(JobStatus::Completed, t2).unwrap();
        assert_eq!(job.finished_at, Some(t2));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn advance_clamps_backwards_clock() {
        let mut job = record();
        let earlier = job.created_at - Duration::seconds(30);

        job.advance(JobStatus::Running, earlier).unwrap();
        job.advance(JobStatus::Failed, earlier).unwrap();

        let started = job.started_at.unwrap();
        let finished = job.finished_at.unwrap();
        assert!(job.created_at <= started);
        assert!(started <= finished);
    }

    #[test]
    fn advance_rejects_skipping_running() {
        let mut job = record();
        let err = job.advance(JobStatus::Completed, Utc::now()).unwrap_err();
        assert_matches!(
            err,
            CoreError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Completed,
                ..
            }
        );
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn advance_rejects_second_terminal_state() {
        let mut job = record();
        job.advance(JobStatus::Running, Utc::now()).unwrap();
        job.advance(JobStatus::Timeout, Utc::now()).unwrap();
        assert!(job.advance(JobStatus::Failed, Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Timeout);
    }

    #[test]
    fn run_params_default_when_fields_missing() {
        let params: RunParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, RunParams::default());
        let params: RunParams = serde_json::from_str(r#"{"duration_secs": 90}"#).unwrap();
        assert_eq!(params.duration_secs, Some(90));
        assert!(!params.verbose);
    }
}
