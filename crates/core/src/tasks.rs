//! Declarative task table and per-task argument conventions.
//!
//! Each demo program takes its arguments differently, so argument
//! construction is an [`ArgumentBuilder`] strategy attached to the
//! [`TaskDefinition`] rather than a branch in the orchestrator. Adding a task
//! means adding a table entry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::job::RunParams;
use crate::resolver;

// ---------------------------------------------------------------------------
// Argument strategies
// ---------------------------------------------------------------------------

/// Inputs available when building a task's command line.
#[derive(Debug, Clone, Copy)]
pub struct ArgContext<'a> {
    /// The job's private output directory.
    pub output_dir: &'a Path,
    pub params: &'a RunParams,
}

/// Builds the arguments that follow the script path.
pub trait ArgumentBuilder: fmt::Debug + Send + Sync {
    fn build(&self, ctx: ArgContext<'_>) -> Vec<String>;
}

/// `<flag> <output_dir> [-v]`, used by `kapustin_yar`.
#[derive(Debug, Clone)]
pub struct OutputDirArgs {
    pub flag: &'static str,
}

impl ArgumentBuilder for OutputDirArgs {
    fn build(&self, ctx: ArgContext<'_>) -> Vec<String> {
        let mut args = vec![
            self.flag.to_string(),
            ctx.output_dir.to_string_lossy().into_owned(),
        ];
        if ctx.params.verbose {
            args.push("-v".to_string());
        }
        args
    }
}

/// No arguments; the program reads everything from its environment.
#[derive(Debug, Clone)]
pub struct NoArgs;

impl ArgumentBuilder for NoArgs {
    fn build(&self, _ctx: ArgContext<'_>) -> Vec<String> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Whether a demo replays a historical event or watches live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Replay,
    Live,
}

/// One row of the task table.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: TaskKind,
    /// Acceptable script names, highest priority first.
    pub script_candidates: Vec<String>,
    /// File whose directory is the script's working root.
    pub root_marker: String,
    /// Program that runs the script (`python3`); `None` runs it directly.
    pub interpreter: Option<String>,
    /// Per-task cap on run time; the global maximum still applies.
    pub timeout: Option<Duration>,
    pub args: Arc<dyn ArgumentBuilder>,
}

/// The demos shipped with the service.
pub fn builtin_tasks(interpreter: &str, root_marker: &str) -> Vec<TaskDefinition> {
    let python = Some(interpreter.to_string());
    vec![
        TaskDefinition {
            id: "vandenberg".into(),
            name: "Vandenberg Falcon 9 Detection".into(),
            description: "Replay detection of a Falcon 9 launch from Vandenberg SFB, CA on \
                          12 June 2019. Produces an animation of the traveling ionospheric \
                          disturbance."
                .into(),
            kind: TaskKind::Replay,
            script_candidates: vec!["vandenburg.py".into(), "vandenberg.py".into()],
            root_marker: root_marker.into(),
            interpreter: python.clone(),
            timeout: None,
            args: Arc::new(NoArgs),
        },
        TaskDefinition {
            id: "korea".into(),
            name: "Korean Peninsula Live Monitor".into(),
            description: "Monitors GNSS data near the Korean peninsula for potential \
                          ballistic missile launches in near-real-time."
                .into(),
            kind: TaskKind::Live,
            script_candidates: vec!["live.py".into(), "korea.py".into()],
            root_marker: root_marker.into(),
            interpreter: python.clone(),
            timeout: None,
            args: Arc::new(NoArgs),
        },
        TaskDefinition {
            id: "kapustin_yar".into(),
            name: "Kapustin Yar Launch Window".into(),
            description: "Plots ionospheric data from stations around Kapustin Yar for the \
                          hour following 21:20 UTC on 8 January 2026."
                .into(),
            kind: TaskKind::Replay,
            script_candidates: vec!["kapustin_yar.py".into(), "kapustinyar.py".into()],
            root_marker: root_marker.into(),
            interpreter: python,
            timeout: None,
            args: Arc::new(OutputDirArgs { flag: "-o" }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A definition paired with what the resolver found on disk.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub definition: TaskDefinition,
    pub script: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl ResolvedTask {
    /// Resolve one definition against `search_root`.
    ///
    /// The working directory is the nearest ancestor of the script holding
    /// the root marker, else the first marker anywhere in the tree, else the
    /// script's own directory.
    pub fn resolve(definition: TaskDefinition, search_root: &Path) -> Self {
        let script = resolver::resolve(&definition.script_candidates, search_root);
        let working_dir = script.as_deref().and_then(|script| {
            resolver::enclosing_root(script, &definition.root_marker, search_root)
                .or_else(|| resolver::resolve_root(&definition.root_marker, search_root))
                .or_else(|| script.parent().map(Path::to_path_buf))
        });

        match &script {
            Some(path) => tracing::info!(
                task_id = %definition.id,
                script = %path.display(),
                "Task script resolved",
            ),
            None => tracing::warn!(
                task_id = %definition.id,
                candidates = ?definition.script_candidates,
                "Task script not found",
            ),
        }

        Self {
            definition,
            script,
            working_dir,
        }
    }

    pub fn is_available(&self) -> bool {
        self.script.is_some()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            kind: self.definition.kind,
            available: self.is_available(),
            script: self.script.as_ref().map(|p| p.to_string_lossy().into_owned()),
            working_dir: self
                .working_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Caller-facing view of a task and its resolution status.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: TaskKind,
    pub available: bool,
    pub script: Option<String>,
    pub working_dir: Option<String>,
}

/// Every known task, resolved once and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: Vec<ResolvedTask>,
}

impl TaskCatalog {
    pub fn resolve(definitions: Vec<TaskDefinition>, search_root: &Path) -> Self {
        let tasks = definitions
            .into_iter()
            .map(|definition| ResolvedTask::resolve(definition, search_root))
            .collect();
        Self { tasks }
    }

    pub fn get(&self, task_id: &str) -> Option<&ResolvedTask> {
        self.tasks.iter().find(|t| t.definition.id == task_id)
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.iter().map(ResolvedTask::summary).collect()
    }

    pub fn definitions(&self) -> Vec<TaskDefinition> {
        self.tasks.iter().map(|t| t.definition.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::touch;

    fn ctx<'a>(dir: &'a Path, params: &'a RunParams) -> ArgContext<'a> {
        ArgContext {
            output_dir: dir,
            params,
        }
    }

    #[test]
    fn output_dir_args_use_the_flag() {
        let params = RunParams::default();
        let args = OutputDirArgs { flag: "-o" }.build(ctx(Path::new("/srv/out/ab12"), &params));
        assert_eq!(args, vec!["-o", "/srv/out/ab12"]);
    }

    #[test]
    fn verbose_appends_v() {
        let params = RunParams {
            verbose: true,
            ..Default::default()
        };
        let args = OutputDirArgs { flag: "-o" }.build(ctx(Path::new("/o"), &params));
        assert_eq!(args, vec!["-o", "/o", "-v"]);
    }

    #[test]
    fn only_kapustin_yar_takes_flags() {
        let params = RunParams {
            duration_secs: Some(120),
            verbose: true,
        };
        let tasks = builtin_tasks("python3", "setup.py");
        let argv = |id: &str| {
            let task = tasks.iter().find(|t| t.id == id).unwrap();
            task.args.build(ctx(Path::new("/o"), &params))
        };

        assert_eq!(argv("kapustin_yar"), vec!["-o", "/o", "-v"]);
        assert!(argv("vandenberg").is_empty());
        assert!(argv("korea").is_empty());
    }

    #[test]
    fn builtin_ids_are_unique() {
        let tasks = builtin_tasks("python3", "setup.py");
        let mut ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), tasks.len());
        assert!(tasks.iter().all(|t| !t.script_candidates.is_empty()));
    }

    #[test]
    fn catalog_reports_resolution() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "missile-tid/setup.py");
        let script = touch(dir.path(), "missile-tid/demos/live.py");

        let catalog = TaskCatalog::resolve(builtin_tasks("python3", "setup.py"), dir.path());

        let korea = catalog.get("korea").unwrap();
        assert!(korea.is_available());
        assert_eq!(korea.script.as_deref(), Some(script.as_path()));
        assert_eq!(
            korea.working_dir.as_deref(),
            Some(dir.path().join("missile-tid").as_path())
        );

        let vandenberg = catalog.get("vandenberg").unwrap();
        assert!(!vandenberg.is_available());
        assert_eq!(vandenberg.working_dir, None);

        let summaries = catalog.summaries();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries.iter().filter(|s| s.available).count(), 1);
        assert!(catalog.get("atlantis").is_none());
    }

    #[test]
    fn working_dir_falls_back_to_script_dir() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "demos/kapustin_yar.py");

        let catalog = TaskCatalog::resolve(builtin_tasks("python3", "setup.py"), dir.path());
        let task = catalog.get("kapustin_yar").unwrap();
        assert_eq!(
            task.working_dir.as_deref(),
            Some(dir.path().join("demos").as_path())
        );
    }
}
