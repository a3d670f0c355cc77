//! Job orchestration core for the TID demo service.
//!
//! Resolves task scripts on disk, runs them as bounded subprocesses, tracks
//! each invocation through its lifecycle, and gathers the files they produce
//! under one artifact root. Nothing here knows about HTTP; the `tid-api`
//! crate maps requests onto [`orchestrator::JobOrchestrator`].

pub mod artifacts;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod tasks;
pub mod types;

/// Shared helpers for tests that drive real subprocesses.
#[cfg(test)]
pub(crate) mod test_helpers {
    use std::path::{Path, PathBuf};

    /// Write `body` as a POSIX shell script at `dir/name`, creating parents.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create script dir");
        }
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
        path
    }

    /// Create an empty file at `dir/name`, creating parents.
    pub fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, b"").expect("touch file");
        path
    }

    /// True while `pid` names a live (non-zombie) process.
    #[cfg(target_os = "linux")]
    pub fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                // Field 3 is the state; the command name in field 2 may
                // contain spaces, so split after the closing paren.
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next())
                    .unwrap_or("X");
                state != "Z" && state != "X"
            }
            Err(_) => false,
        }
    }
}
