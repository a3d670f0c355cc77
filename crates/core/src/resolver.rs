//! Script and project-root discovery.
//!
//! Traversal order decides which file wins when the same name exists more
//! than once under the search root:
//!
//! - depth-first;
//! - inside a directory, regular files are visited before subdirectories;
//! - each group is visited in byte order of the file name;
//! - hidden directories (leading `.`) and [`SKIPPED_DIRS`] are not entered.
//!
//! So `root/x.py` beats `root/a/x.py`, and `root/a/deep/x.py` beats
//! `root/b/x.py`. Candidate names are tried in priority order: the whole
//! tree is searched for the first candidate before the second is looked at.
//!
//! These functions walk the filesystem synchronously; async callers run
//! them on the blocking pool.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into.
pub const SKIPPED_DIRS: &[&str] = &["__pycache__", "node_modules", "target"];

/// Find the first file matching one of `candidates`, in candidate order.
///
/// A candidate is a file name (`live.py`) or a relative path suffix
/// (`demos/live.py`); it matches when the entry's path ends with it,
/// component-wise. Returns `None` when nothing matches.
pub fn resolve<S: AsRef<str>>(candidates: &[S], search_root: &Path) -> Option<PathBuf> {
    candidates.iter().find_map(|candidate| {
        let wanted = Path::new(candidate.as_ref());
        walk_files(search_root).find(|path| path.ends_with(wanted))
    })
}

/// Locate `marker` anywhere under `search_root` and return its directory.
pub fn resolve_root(marker: &str, search_root: &Path) -> Option<PathBuf> {
    resolve(&[marker], search_root).and_then(|path| path.parent().map(Path::to_path_buf))
}

/// Nearest ancestor of `script` (not above `search_root`) holding `marker`.
pub fn enclosing_root(script: &Path, marker: &str, search_root: &Path) -> Option<PathBuf> {
    script
        .ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(search_root))
        .find(|dir| dir.join(marker).is_file())
        .map(Path::to_path_buf)
}

/// Every regular file under `root`, in the documented traversal order.
fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by(files_first)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry during script search");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
}

fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

fn is_skipped(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
