#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tid_core::config::OrchestratorConfig;
use tid_core::orchestrator::JobOrchestrator;
use tid_core::tasks::{NoArgs, TaskDefinition, TaskKind};
use tower::ServiceExt;

use tid_api::app::build_app;
use tid_api::config::ServerConfig;
use tid_api::state::AppState;

/// A running app over a scratch search root and artifact root.
pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<JobOrchestrator>,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    /// Root of the fake project holding the task scripts.
    pub fn project(&self) -> PathBuf {
        self.dir.path().join("search/proj")
    }

    pub fn artifact_root(&self) -> &Path {
        self.orchestrator.artifact_root()
    }
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config(orchestrator: OrchestratorConfig) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        orchestrator,
    }
}

/// A task run as `sh <script>` with no extra arguments.
pub fn shell_task(id: &str, script: &str) -> TaskDefinition {
    TaskDefinition {
        id: id.into(),
        name: format!("Test task {id}"),
        description: "Shell script used by the API tests".into(),
        kind: TaskKind::Replay,
        script_candidates: vec![script.into()],
        root_marker: "setup.py".into(),
        interpreter: Some("sh".into()),
        timeout: None,
        args: Arc::new(NoArgs),
    }
}

/// Write `scripts` under `search/proj/demos`, then build the full router.
pub async fn build_test_app(
    scripts: &[(&str, &str)],
    definitions: Vec<TaskDefinition>,
    job_timeout: Duration,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("search/proj");
    std::fs::create_dir_all(project.join("demos")).unwrap();
    std::fs::write(project.join("setup.py"), b"").unwrap();
    for (name, body) in scripts {
        std::fs::write(project.join("demos").join(name), format!("#!/bin/sh\n{body}")).unwrap();
    }

    let orchestrator_config = OrchestratorConfig {
        search_root: dir.path().join("search"),
        artifact_root: dir.path().join("artifacts"),
        job_timeout,
        ..Default::default()
    };
    let orchestrator = Arc::new(
        JobOrchestrator::start(orchestrator_config.clone(), definitions)
            .await
            .unwrap(),
    );
    let state = AppState {
        config: Arc::new(test_config(orchestrator_config)),
        orchestrator: Arc::clone(&orchestrator),
    };

    TestApp {
        router: build_app(state).unwrap(),
        orchestrator,
        dir,
    }
}

pub async fn get(app: &TestApp, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

/// GET `uri` with one extra request header.
pub async fn get_with_header(
    app: &TestApp,
    uri: &str,
    name: &str,
    value: &str,
) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(name, value)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &TestApp, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Poll `GET /api/v1/jobs/{id}` until the job is terminal.
pub async fn wait_for_job(app: &TestApp, job_id: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let json = body_json(get(app, &format!("/api/v1/jobs/{job_id}")).await).await;
        let status = json["data"]["status"].as_str().unwrap().to_string();
        if !matches!(status.as_str(), "queued" | "running") {
            return json["data"].clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
