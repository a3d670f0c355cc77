//! Artifact collection and safe lookup under the shared artifact root.
//!
//! Layout: `{root}/{job_id}/...`. Each job writes only into its own
//! subdirectory; every path handed to callers is relative to `root` and
//! `/`-separated.
//!
//! Collection is best effort. A file that cannot be read or copied is
//! logged and skipped; it never changes the job's outcome.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::error::CoreError;
use crate::types::JobId;

/// File extensions (lowercase) treated as job artifacts.
pub const ARTIFACT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "mp4", "webm", "html", "pdf",
];

/// Subdirectories of the working directory where demos drop results when
/// they ignore `TID_OUTPUT_DIR`.
pub const FALLBACK_SUBDIRS: &[&str] = &["outputs", "demos/outputs"];

/// Filesystem timestamps can lag the wall clock by a tick; allow for it when
/// deciding whether a stray file was written during the job.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Whether `path` has one of the [`ARTIFACT_EXTENSIONS`].
pub fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ARTIFACT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// MIME type for an artifact, by extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "html" => "text/html; charset=utf-8",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Stray ownership
// ---------------------------------------------------------------------------

/// The span during which a job ran in its working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub start: SystemTime,
    /// `None` while the job is still running.
    pub end: Option<SystemTime>,
}

impl RunWindow {
    /// Whether a file modified at `mtime` could have been written by this run.
    pub fn covers(&self, mtime: SystemTime) -> bool {
        let start = self.start.checked_sub(MTIME_SLACK).unwrap_or(self.start);
        mtime >= start && self.end.map_or(true, |end| mtime <= end + MTIME_SLACK)
    }
}

/// Recent run windows per shared working directory.
///
/// A stray written while two jobs ran in the same directory cannot be
/// attributed to either of them, so neither adopts it. Finished windows are
/// kept until no run that could overlap them remains.
#[derive(Debug, Default)]
pub struct StrayLedger {
    runs: Mutex<HashMap<PathBuf, Vec<(JobId, RunWindow)>>>,
}

impl StrayLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `job_id` started running in `dir` at `start`.
    pub async fn open(&self, dir: &Path, job_id: &str, start: SystemTime) {
        let mut runs = self.runs.lock().await;
        let windows = runs.entry(dir.to_path_buf()).or_default();
        windows.push((job_id.to_string(), RunWindow { start, end: None }));
        prune(windows, start);
    }

    /// Close `job_id`'s window at `end` and return the windows of every other
    /// recent run in `dir`.
    pub async fn close(&self, dir: &Path, job_id: &str, end: SystemTime) -> Vec<RunWindow> {
        let mut runs = self.runs.lock().await;
        let Some(windows) = runs.get_mut(dir) else {
            return Vec::new();
        };
        for (id, window) in windows.iter_mut() {
            if *id == job_id {
                window.end = Some(end);
            }
        }
        let others = windows
            .iter()
            .filter(|(id, _)| id != job_id)
            .map(|(_, window)| *window)
            .collect();

        prune(windows, end);
        if windows.is_empty() {
            runs.remove(dir);
        }
        others
    }
}

/// Drop finished windows that ended too long before any live run began.
fn prune(windows: &mut Vec<(JobId, RunWindow)>, now: SystemTime) {
    let earliest = windows
        .iter()
        .filter(|(_, w)| w.end.is_none())
        .map(|(_, w)| w.start)
        .fold(now, SystemTime::min);
    let horizon = earliest.checked_sub(MTIME_SLACK * 2).unwrap_or(earliest);
    windows.retain(|(_, w)| w.end.map_or(true, |end| end >= horizon));
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Map a caller-supplied relative path to a file inside `root`.
///
/// Rejects empty, absolute, and `..`-bearing paths outright, then
/// canonicalizes so a symlink cannot lead outside the root either.
pub fn resolve_artifact(root: &Path, relative: &str) -> Result<PathBuf, CoreError> {
    if relative.trim().is_empty() || relative.contains('\0') {
        return Err(CoreError::Validation("Artifact path is empty".into()));
    }
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(CoreError::Validation(format!(
            "Artifact path '{relative}' leaves the artifact root"
        )));
    }

    let not_found = || CoreError::NotFound {
        entity: "Artifact",
        id: relative.to_string(),
    };
    let root = root
        .canonicalize()
        .map_err(|e| CoreError::Internal(format!("Artifact root unavailable: {e}")))?;
    let resolved = root.join(rel).canonicalize().map_err(|_| not_found())?;

    if !resolved.starts_with(&root) {
        return Err(CoreError::Validation(format!(
            "Artifact path '{relative}' leaves the artifact root"
        )));
    }
    if !resolved.is_file() {
        return Err(not_found());
    }
    Ok(resolved)
}

/// Gathers a job's output files into its directory under the artifact root.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    root: PathBuf,
}

impl ArtifactCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The private output directory for `job_id`.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Copy stray results from `fallback_dir` into `output_dir`, then list
    /// every artifact under `output_dir`.
    ///
    /// Strays are looked for directly in `fallback_dir` and in its
    /// [`FALLBACK_SUBDIRS`]. With `since` set, only files modified at or
    /// after that instant are adopted, and a file modified inside any of the
    /// `contested` windows is left alone. Existing destinations are never
    /// overwritten, so repeated calls converge on the same result.
    pub fn collect(
        &self,
        output_dir: &Path,
        fallback_dir: &Path,
        since: Option<SystemTime>,
        contested: &[RunWindow],
    ) -> Vec<String> {
        if let Err(e) = fs::create_dir_all(output_dir) {
            tracing::warn!(
                dir = %output_dir.display(),
                error = %e,
                "Cannot create output directory",
            );
            return Vec::new();
        }

        let since = since.map(|t| t.checked_sub(MTIME_SLACK).unwrap_or(t));
        let scan_dirs = std::iter::once(fallback_dir.to_path_buf())
            .chain(FALLBACK_SUBDIRS.iter().map(|sub| fallback_dir.join(sub)));
        for dir in scan_dirs {
            if same_dir(&dir, output_dir) {
                continue;
            }
            self.adopt_strays(&dir, output_dir, since, contested);
        }

        self.list(output_dir)
    }

    /// Every artifact under `dir`, relative to the root, sorted.
    pub fn list(&self, dir: &Path) -> Vec<String> {
        let mut found: Vec<String> = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable artifact entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_artifact(entry.path()))
            .filter_map(|entry| self.relative(entry.path()))
            .collect();
        found.sort();
        found.dedup();
        found
    }

    fn adopt_strays(
        &self,
        dir: &Path,
        output_dir: &Path,
        since: Option<SystemTime>,
        contested: &[RunWindow],
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file || !is_artifact(&path) {
                continue;
            }
            if since.is_some() || !contested.is_empty() {
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if since.is_some_and(|since| modified < since) {
                    continue;
                }
                if contested.iter().any(|window| window.covers(modified)) {
                    tracing::warn!(
                        path = %path.display(),
                        "Stray written while another job shared the directory, not adopting",
                    );
                    continue;
                }
            }

            let dest = output_dir.join(entry.file_name());
            if dest.exists() {
                continue;
            }
            match fs::copy(&path, &dest) {
                Ok(bytes) => tracing::debug!(
                    from = %path.display(),
                    to = %dest.display(),
                    bytes,
                    "Adopted stray artifact",
                ),
                Err(e) => tracing::warn!(
                    from = %path.display(),
                    error = %e,
                    "Failed to copy stray artifact, skipping",
                ),
            }
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        match path.strip_prefix(&self.root) {
            Ok(rel) => Some(
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            ),
            Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    "Artifact outside the artifact root, ignoring",
                );
                None
            }
        }
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
