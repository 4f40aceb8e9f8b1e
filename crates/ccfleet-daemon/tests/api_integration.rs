#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use ccfleet_core::RuleSet;
use ccfleet_daemon::monitor::MonitorConfig;
use ccfleet_daemon::orchestration::{InstanceManager, ManagerConfig};
use ccfleet_daemon::server::{AppState, build_router};
use ccfleet_daemon::storage::Database;
use ccfleet_daemon::terminal::TerminalMultiplexer;
use ccfleet_daemon::worktree::{WorktreeLayout, WorktreeManager};

async fn app() -> axum::Router {
    let db = Database::open_in_memory().await.unwrap();
    let manager = InstanceManager::new(
        db.clone(),
        WorktreeManager::new(WorktreeLayout::Global(std::env::temp_dir()), None),
        Arc::new(TerminalMultiplexer::with_defaults()),
        ManagerConfig {
            agent_bin: PathBuf::from("sh"),
            agent_args: vec!["-c".into(), "exit 0".into()],
            monitor: MonitorConfig::default(),
            rules: Arc::new(RuleSet::builtin()),
        },
    );
    build_router(AppState {
        manager: Arc::new(manager),
        db,
        default_max_parallelism: 3,
        terminal_root: std::env::temp_dir(),
    })
}

/// Send a request and return (status, body). Empty bodies become `null`
/// and non-JSON bodies a JSON string.
async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, json)
}

async fn create_project(app: &axum::Router, id: &str, max: Option<i64>) {
    let mut body = json!({"id": id, "name": id, "working_directory": "/tmp"});
    if let Some(max) = max {
        body["max_parallelism"] = json!(max);
    }
    let (status, _) = send(app, Method::POST, "/api/projects", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn create_task(app: &axum::Router, project: &str, id: &str) {
    let (status, body) = send(
        app,
        Method::POST,
        &format!("/api/projects/{project}/tasks"),
        Some(json!({"id": id, "title": format!("task {id}")})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

// =========================================================================
// Health and projects
// =========================================================================

#[tokio::test]
async fn health_reports_components() {
    let app = app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "serving");
    assert_eq!(body["terminals"]["session_count"], 0);
    assert_eq!(body["components"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn project_creation_applies_default_quota_and_rejects_duplicates() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/projects",
        Some(json!({"id": "p1", "name": "demo", "working_directory": "/tmp"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["max_parallelism"], 3);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/projects",
        Some(json!({"id": "p1", "name": "again", "working_directory": "/tmp"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("p1"));

    let (status, _) = send(&app, Method::GET, "/api/projects/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::PATCH,
        "/api/projects/p1",
        Some(json!({"max_parallelism": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::PATCH,
        "/api/projects/p1",
        Some(json!({"max_parallelism": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_parallelism"], 5);
}

#[tokio::test]
async fn task_type_must_be_known() {
    let app = app().await;
    create_project(&app, "p1", None).await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/projects/p1/tasks",
        Some(json!({"title": "x", "task_type": "bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/projects/p1/tasks",
        Some(json!({"title": "Set up schema", "task_type": "database"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["task_type"], "database");
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn duplicate_task_id_is_conflict() {
    let app = app().await;
    create_project(&app, "p1", None).await;
    create_task(&app, "p1", "a").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/projects/p1/tasks",
        Some(json!({"id": "a", "title": "again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Already exists: Task a");
}

// =========================================================================
// Scheduling
// =========================================================================

#[tokio::test]
async fn dependencies_drive_readiness_and_reject_cycles() {
    let app = app().await;
    create_project(&app, "p1", None).await;
    for id in ["a", "b"] {
        create_task(&app, "p1", id).await;
    }

    let (status, body) = send(&app, Method::POST, "/api/tasks/b/dependencies/a", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["added"], true);

    let (status, body) = send(&app, Method::POST, "/api/tasks/b/dependencies/a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], false);

    let (status, body) = send(&app, Method::POST, "/api/tasks/a/dependencies/b", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("Cyclic dependency detected"),
        "{body}"
    );

    let (status, body) = send(&app, Method::GET, "/api/projects/p1/ready-tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    let ready: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ready, vec!["a"]);

    let (status, body) = send(&app, Method::POST, "/api/projects/p1/analyze", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phases"].as_array().unwrap().len(), 2);
    assert_eq!(body["phases"][0]["task_ids"], json!(["a"]));
    assert_eq!(body["phases"][1]["name"], "Phase 2");

    let (status, body) = send(&app, Method::GET, "/api/projects/p1/phases", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::DELETE, "/api/tasks/b/dependencies/a", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, "/api/tasks/b/dependencies/a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blocked_task_cannot_start() {
    let app = app().await;
    create_project(&app, "p1", None).await;
    for id in ["a", "b"] {
        create_task(&app, "p1", id).await;
    }
    send(&app, Method::POST, "/api/tasks/b/dependencies/a", None).await;

    let (status, parent) = send(&app, Method::POST, "/api/projects/p1/instances", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let parent_id = parent["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{parent_id}/children"),
        Some(json!({"task_id": "b"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("waiting on a"), "{body}");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{parent_id}/children"),
        Some(json!({"task_id": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =========================================================================
// Instances
// =========================================================================

#[tokio::test]
async fn parent_instance_lifecycle() {
    let app = app().await;
    create_project(&app, "p1", None).await;

    let (status, parent) = send(&app, Method::POST, "/api/projects/p1/instances", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(parent["status"], "running");
    assert_eq!(parent["role"]["type"], "parent");
    let id = parent["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, &format!("/api/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], "p1");

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/instances?project_id=p1&status=running",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::GET, "/api/instances?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{id}/terminate"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "terminated");
    assert_eq!(body["instance"]["status"], "terminated");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{id}/terminate"),
        Some(json!({"force": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_terminal");

    let (status, _) = send(&app, Method::GET, "/api/instances/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn quota_rejection_is_too_many_requests() {
    let app = app().await;
    create_project(&app, "p1", Some(1)).await;

    let (status, _) = send(&app, Method::POST, "/api/projects/p1/instances", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::POST, "/api/projects/p1/instances", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("p1"), "{body}");
}

#[tokio::test]
async fn progress_must_be_a_percentage() {
    let app = app().await;
    create_project(&app, "p1", None).await;
    let (_, parent) = send(&app, Method::POST, "/api/projects/p1/instances", None).await;
    let id = parent["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{id}/progress"),
        Some(json!({"percent": 140})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/instances/{id}/progress"),
        Some(json!({"percent": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 100);
}
