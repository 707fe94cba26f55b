use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use cubehost::{
    files::{FileManager, FilePolicy},
    ports::{PortAllocator, PortRange},
    runtime::mock::MockRuntime,
    store::MemoryStore,
    tasks::{Lifecycle, LifecycleConfig},
    worker::{ApiServer, Dispatcher, DispatcherConfig},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

fn app(root: &TempDir) -> Router {
    let runtime = Arc::new(MockRuntime::new());
    let store = Arc::new(MemoryStore::new());
    let lifecycle = Arc::new(Lifecycle::new(
        runtime.clone(),
        store.clone(),
        Arc::new(PortAllocator::new(PortRange::default())),
        LifecycleConfig {
            data_root: root.path().to_path_buf(),
            stop_grace: Duration::from_millis(50),
            kill_slack: Duration::from_millis(50),
        },
    ));
    let (dispatcher, _) = Dispatcher::start(store.clone(), lifecycle, DispatcherConfig::default());
    let files = Arc::new(FileManager::new(runtime, store, FilePolicy::default()));
    ApiServer::new(dispatcher, files).router()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn create_job_is_accepted_and_pollable() {
    let root = TempDir::new().unwrap();
    let app = app(&root);
    let server_id = Uuid::new_v4();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/servers/{server_id}/jobs"),
        Some(json!({
            "type": "CREATE",
            "payload": { "server": {
                "name": "lobby",
                "image": "itzg/minecraft-server",
                "game": "minecraft",
                "memory_cap_mb": 1024,
                "cpu_shares": 512,
                "ports": [{ "container_port": 25565 }]
            }}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut last = Value::Null;
    for _ in 0..200 {
        let (status, job) = send(&app, Method::GET, &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        last = job;
        if last["status"] == "SUCCESS" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["status"], "SUCCESS");
    assert_eq!(last["progress"], 100);
}

#[tokio::test]
async fn errors_render_kind_and_message() {
    let root = TempDir::new().unwrap();
    let app = app(&root);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/servers/{}/jobs", Uuid::new_v4()),
        Some(json!({ "type": "START" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "NotFound");
    assert!(body["message"].as_str().unwrap().contains("not found"));

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/servers/{}/files?path=../../etc", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "PathTraversal");
}
