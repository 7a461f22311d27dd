// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire-level tests: status mapping, body limits, content types, correlation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use corral_core::audit::AuditLog;
use corral_core::clock::SystemClock;
use corral_core::events::NoopPublisher;
use corral_core::http::{build_router, AppState, MAX_BODY_BYTES};
use corral_core::lifecycle::{Lifecycle, LifecycleOptions};
use corral_core::store::{MemoryStore, RunStore};
use corral_core::throttle::{HeartbeatThrottle, ThrottleConfig};

fn build_app() -> Router {
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(SystemClock);
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        Arc::new(NoopPublisher),
        AuditLog::new(store),
        clock.clone(),
        HeartbeatThrottle::new(ThrottleConfig::default(), clock),
        LifecycleOptions::default(),
    ));
    build_router(AppState::new(lifecycle), Duration::from_secs(30))
}

fn post_json(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn create_run_body(id: &str) -> String {
    json!({
        "id": id,
        "experiment_id": "exp-1",
        "version_id": "v1",
        "launch_manifest": {},
        "created_by": "alice",
    })
    .to_string()
}

fn heartbeat_body(run_id: &str, step: i64) -> String {
    json!({
        "run_id": run_id,
        "status": "running",
        "step": step,
        "samples_per_sec": 250.0,
        "loss": 0.42,
        "checkpoint_version": 1,
    })
    .to_string()
}

/// A syntactically valid heartbeat body padded to an exact byte length.
fn heartbeat_body_of_len(run_id: &str, len: usize) -> String {
    let template = format!(
        r#"{{"run_id":"{run_id}","status":"running","step":1,"samples_per_sec":1.0,"loss":0.1,"checkpoint_version":0,"notes":""}}"#
    );
    assert!(len >= template.len(), "target length too small");
    let pad = "x".repeat(len - template.len());
    let body = format!(
        r#"{{"run_id":"{run_id}","status":"running","step":1,"samples_per_sec":1.0,"loss":0.1,"checkpoint_version":0,"notes":"{pad}"}}"#
    );
    assert_eq!(body.len(), len);
    body
}

#[tokio::test]
async fn create_run_returns_201_with_queued_state() {
    let app = build_app();
    let response = app
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["id"], "run-1");
    assert_eq!(body["state"], "queued");
    assert_eq!(body["health_status"], "healthy");
}

#[tokio::test]
async fn create_run_generates_an_id_when_absent() {
    let app = build_app();
    let body = json!({
        "experiment_id": "exp-1",
        "version_id": "v1",
        "launch_manifest": {},
        "created_by": "alice",
    })
    .to_string();

    let response = app.oneshot(post_json("/api/v1/runs", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn get_unknown_run_is_404_with_error_envelope() {
    let app = build_app();
    let response = app.oneshot(get("/api/v1/runs/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn heartbeat_updates_the_run() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 100),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["state"], "running");
    assert_eq!(body["runtime_status"], "running");
    assert_eq!(body["current_step"], 100);
}

#[tokio::test]
async fn rapid_second_heartbeat_is_throttled_with_retry_after() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 100),
        ))
        .await
        .unwrap();

    // Well inside the five-second floor. (The regression → 409 path is
    // covered at the service level, where the clock is controllable.)
    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 90),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn heartbeat_without_json_content_type_is_415() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/runs/run-1/heartbeat")
        .body(Body::from(heartbeat_body("run-1", 1)))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn malformed_json_is_400() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            "{not json".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid");
}

#[tokio::test]
async fn missing_required_field_is_422() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            json!({"run_id": "run-1", "status": "running"}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn heartbeat_body_at_the_limit_is_accepted_one_byte_over_rejected() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-2")))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body_of_len("run-1", MAX_BODY_BYTES),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-2/heartbeat",
            heartbeat_body_of_len("run-2", MAX_BODY_BYTES + 1),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn command_flow_over_http() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 100),
        ))
        .await
        .unwrap();

    // No pending commands yet.
    let response = app
        .clone()
        .oneshot(get("/api/v1/runs/run-1/commands/next"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Submit a pause.
    let submit = json!({
        "id": "cmd-A",
        "type": "pause",
        "actor": {"type": "operator", "id": "alice"},
        "issued_at": "2024-05-09T11:00:00Z",
        "payload": {},
    })
    .to_string();
    let response = app
        .clone()
        .oneshot(post_json("/api/v1/runs/run-1/commands", submit))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["id"], "cmd-A");
    assert!(body.get("delivered_at").is_none());

    // Deliver it.
    let response = app
        .clone()
        .oneshot(get("/api/v1/runs/run-1/commands/next"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "cmd-A");
    assert!(body["delivered_at"].is_string());

    // Acknowledge; the run pauses.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/commands/cmd-A/ack",
            String::new(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/v1/runs/run-1")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["state"], "paused");
}

#[tokio::test]
async fn invalid_tune_payload_is_422_divergent_resubmit_409() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 100),
        ))
        .await
        .unwrap();

    let tune = |id: &str, lr: f64| {
        json!({
            "id": id,
            "type": "tune",
            "actor": {"type": "operator", "id": "alice"},
            "issued_at": "2024-05-09T11:00:00Z",
            "payload": {"learning_rate": lr},
        })
        .to_string()
    };

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/runs/run-1/commands", tune("cmd-B", 0.5)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/runs/run-1/commands", tune("cmd-X", 1.5)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app
        .oneshot(post_json("/api/v1/runs/run-1/commands", tune("cmd-B", 0.7)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn ack_before_delivery_is_422() {
    let app = build_app();
    app.clone()
        .oneshot(post_json("/api/v1/runs", create_run_body("run-1")))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/api/v1/runs/run-1/heartbeat",
            heartbeat_body("run-1", 100),
        ))
        .await
        .unwrap();

    let submit = json!({
        "id": "cmd-A",
        "type": "pause",
        "actor": {"type": "operator", "id": "alice"},
        "issued_at": "2024-05-09T11:00:00Z",
        "payload": {},
    })
    .to_string();
    app.clone()
        .oneshot(post_json("/api/v1/runs/run-1/commands", submit))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/runs/run-1/commands/cmd-A/ack",
            String::new(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let app = build_app();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/healthz")
        .header("x-correlation-id", "corr-42")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-correlation-id"], "corr-42");

    // Generated when absent.
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert!(!response.headers()["x-correlation-id"].is_empty());
}

#[tokio::test]
async fn healthz_reports_store_health() {
    let app = build_app();
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store_healthy"], true);
}
