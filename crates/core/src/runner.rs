//! Subprocess execution with bounded output capture and a hard deadline.
//!
//! [`run`] spawns the program in its own process group, drains stdout and
//! stderr concurrently into [`TailBuffer`]s, and waits for exit or the
//! deadline. At the deadline the whole group is killed and reaped before
//! `run` returns, so nothing the job started outlives it.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::job::JobStatus;

/// Default bytes retained per stream.
pub const DEFAULT_TAIL_BYTES: usize = 5_000;

/// Read size for draining pipes.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long to wait for a killed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// How long pipe readers may run on after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Program to execute: a path, or a bare name looked up on `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Bytes retained from the end of each output stream.
    pub tail_bytes: usize,
}

/// How a launched process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Terminal job state implied by this outcome.
    pub fn job_status(&self) -> JobStatus {
        if self.timed_out {
            JobStatus::Timeout
        } else if self.exit_code == Some(0) {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }
}

/// The process could not be started or supervised.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Executable not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Working directory not found: {0}")]
    WorkingDir(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while waiting for process: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Tail buffer
// ---------------------------------------------------------------------------

/// Keeps only the last `capacity` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    capacity: usize,
    bytes: VecDeque<u8>,
    total: u64,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if chunk.len() >= self.capacity {
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.capacity);
        self.bytes.drain(..excess);
    }

    /// Bytes ever pushed, including discarded ones.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    /// Decode the retained bytes, dropping a UTF-8 sequence cut in half by
    /// truncation.
    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut bytes = Vec::with_capacity(self.bytes.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);

        let skip = if self.is_truncated() {
            bytes
                .iter()
                .take(3)
                .take_while(|b| (**b & 0xC0) == 0x80)
                .count()
        } else {
            0
        };
        String::from_utf8_lossy(&bytes[skip..]).into_owned()
    }
}

type SharedTail = Arc<Mutex<TailBuffer>>;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Launch `request.program` and supervise it until exit or the deadline.
///
/// Non-zero exits and timeouts are reported in the [`RunOutcome`]; an `Err`
/// means the process never ran or could not be waited on.
pub async fn run(request: RunRequest) -> Result<RunOutcome, RunError> {
    check_program(&request.program).await?;
    if !tokio::fs::metadata(&request.working_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(RunError::WorkingDir(
            request.working_dir.display().to_string(),
        ));
    }

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.working_dir)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // New group led by the child, so the timeout can signal every descendant.
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_error(&request.program, e))?;
    let pid = child.id();

    let stdout = Arc::new(Mutex::new(TailBuffer::new(request.tail_bytes)));
    let stderr = Arc::new(Mutex::new(TailBuffer::new(request.tail_bytes)));
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stdout))));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stderr))));

    let wait_result = tokio::time::timeout(request.timeout, child.wait()).await;
    let (exit_code, timed_out) = match wait_result {
        Ok(Ok(status)) => {
            // Sweep up anything the program left running in its group. The
            // leader is already reaped, so this is best effort: an emptied
            // group is left alone rather than signalled by id.
            if let Some(pid) = pid.filter(|&pid| process_group_alive(pid)) {
                kill_process_group(pid);
            }
            (status.code(), false)
        }
        Ok(Err(e)) => {
            terminate(&mut child, pid).await;
            return Err(RunError::Io(e));
        }
        Err(_elapsed) => {
            tracing::warn!(
                pid,
                timeout_ms = request.timeout.as_millis() as u64,
                "Process exceeded its deadline, killing process group",
            );
            (terminate(&mut child, pid).await, true)
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    finish_reader(stdout_task).await;
    finish_reader(stderr_task).await;

    Ok(RunOutcome {
        exit_code,
        stdout_tail: read_tail(&stdout),
        stderr_tail: read_tail(&stderr),
        timed_out,
        duration_ms,
    })
}

/// Send `SIGKILL` to the process group led by `pid`.
///
/// Safe to call any number of times: a group that is already gone is not an
/// error.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: killpg has no memory-safety preconditions; an invalid or
        // vanished group only yields ESRCH.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::debug!(pid, error = %err, "killpg failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Whether any process is still a member of group `pid`.
pub fn process_group_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence and permission.
        let rc = unsafe { libc::killpg(pgid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Kill the child's group and reap the child. Returns its exit code if any.
async fn terminate(child: &mut Child, pid: Option<u32>) -> Option<i32> {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    let _ = child.start_kill();
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(pid, error = %e, "Failed to reap killed process");
            None
        }
        Err(_) => {
            tracing::warn!(pid, "Killed process was not reaped in time");
            None
        }
    }
}

/// Verify an explicit program path exists and is executable.
///
/// Bare names (`python3`) are left to the `PATH` lookup at spawn time.
async fn check_program(program: &Path) -> Result<(), RunError> {
    if program.components().count() < 2 {
        return Ok(());
    }
    let metadata = tokio::fs::metadata(program)
        .await
        .map_err(|_| RunError::NotFound(program.display().to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = metadata.permissions().mode();
        if metadata.is_dir() || mode & 0o111 == 0 {
            return Err(RunError::PermissionDenied(format!(
                "{} is not executable (mode {mode:#o})",
                program.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    Ok(())
}

fn spawn_error(program: &Path, err: io::Error) -> RunError {
    let program = program.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => RunError::NotFound(program),
        io::ErrorKind::PermissionDenied => RunError::PermissionDenied(program),
        _ => RunError::Spawn {
            program,
            source: err,
        },
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, sink: SharedTail) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Give a reader a moment to hit EOF, then stop it.
async fn finish_reader(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn read_tail(tail: &SharedTail) -> String {
    tail.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .to_string_lossy()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
