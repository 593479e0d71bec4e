//! HTTP surface driven through the router without a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use preview_sandbox::{router, AppState, Config, InMemoryEngine};

fn app(port_start: u16) -> (tempfile::TempDir, Router) {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.preview.work_dir = tmp.path().to_path_buf();
    config.preview.port_range_start = port_start;
    config.preview.port_range_end = port_start + 20;
    config.preview.health_poll_interval_ms = 5;
    config.preview.settle_delay_ms = 0;

    let state = AppState::new(Arc::new(InMemoryEngine::new()), &config);
    (tmp, router(state))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (_tmp, app) = app(48600);
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_get_and_stop_preview() {
    let (_tmp, app) = app(48630);
    let (status, body) = call(
        &app,
        Method::POST,
        "/preview",
        Some(json!({
            "projectId": "site",
            "files": { "index.html": "<h1>hi</h1>" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], "site");
    assert_eq!(body["status"], "running");
    let port = body["port"].as_u64().unwrap();
    assert!((48630..48650).contains(&port));
    assert!(body["url"].as_str().unwrap().ends_with(&format!(":{}", port)));

    let (status, body) = call(&app, Method::GET, "/preview/site", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = call(&app, Method::GET, "/preview", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previews"].as_array().unwrap().len(), 1);

    let (status, body) = call(&app, Method::GET, "/preview/site/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    let logs: Vec<String> = serde_json::from_value(body["logs"].clone()).unwrap();
    assert!(logs.iter().any(|l| l == "--- Container Logs ---"));

    let (status, body) = call(&app, Method::DELETE, "/preview/site", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Preview stopped successfully");

    let (status, body) = call(&app, Method::DELETE, "/preview/site", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = call(&app, Method::GET, "/preview/site", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_files_are_rejected() {
    let (_tmp, app) = app(48660);
    let (status, body) = call(
        &app,
        Method::POST,
        "/preview",
        Some(json!({ "project_id": "blank", "files": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "no_files");

    let (status, _) = call(&app, Method::GET, "/preview/blank", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn numeric_project_ids_are_accepted() {
    let (_tmp, app) = app(48690);
    let (status, body) = call(
        &app,
        Method::POST,
        "/preview",
        Some(json!({ "project_id": 42, "files": { "index.html": "x" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], "42");

    let (status, _) = call(&app, Method::GET, "/preview/42", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn file_store_round_trip() {
    let (_tmp, app) = app(48720);

    let (status, body) = call(
        &app,
        Method::PUT,
        "/projects/docs/files",
        Some(json!({ "index.html": "v1", "css/site.css": "body{}" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["written"], 2);

    let (status, body) = call(
        &app,
        Method::POST,
        "/projects/docs/commits",
        Some(json!({ "message": "first" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first = body["commit_id"].as_str().unwrap().to_string();

    call(
        &app,
        Method::PUT,
        "/projects/docs/files",
        Some(json!({ "index.html": "v2" })),
    )
    .await;
    let (status, body) = call(
        &app,
        Method::DELETE,
        "/projects/docs/files/css/site.css",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, body) = call(
        &app,
        Method::POST,
        "/projects/docs/commits",
        Some(json!({ "message": "second" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["commit_id"], first.as_str());

    let (status, body) = call(&app, Method::GET, "/projects/docs/history?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commits"].as_array().unwrap().len(), 2);

    let (status, _) = call(
        &app,
        Method::POST,
        "/projects/docs/rollback",
        Some(json!({ "commit_id": first })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        Method::POST,
        "/projects/docs/rollback",
        Some(json!({ "commit_id": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "commit_not_found");
}

#[tokio::test]
async fn unsafe_paths_are_rejected() {
    let (_tmp, app) = app(48750);
    let (status, body) = call(
        &app,
        Method::PUT,
        "/projects/evil/files",
        Some(json!({ "../escape.txt": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_path");
}

#[tokio::test]
async fn unknown_project_status_is_not_found() {
    let (_tmp, app) = app(48780);
    let (status, body) = call(&app, Method::GET, "/projects/ghost/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}
