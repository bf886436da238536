//! Integration tests for the status API handlers
//!
//! Requests go straight through the router with `oneshot`; pools are backed
//! by the in-memory control plane.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use common::fixtures::*;
use orchestrator::constants::methods;
use orchestrator::operation::OperationState;
use orchestrator::snapshot::{SharedSnapshot, StaticSnapshot};
use orchestrator::web::{create_router, AppState, PoolHandle};
use orchestrator::Config;

struct TestApp {
    state: AppState,
    session: Arc<InMemorySession>,
    snapshot: SharedSnapshot,
}

fn test_app(snapshot: StaticSnapshot) -> TestApp {
    let (session, connection) = connection("lab");
    let snapshot = SharedSnapshot::new(snapshot);
    let mut pools = HashMap::new();
    pools.insert(
        "lab".to_string(),
        PoolHandle {
            connection,
            snapshots: Arc::new(snapshot.clone()),
        },
    );
    TestApp {
        state: AppState::new(Arc::new(Config::default()), pools),
        session,
        snapshot,
    }
}

async fn send(
    state: &AppState,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_for_state(state: &AppState, id: &str, wanted: OperationState) {
    let id = Uuid::parse_str(id).unwrap();
    let operation = state.history.find(id).await.unwrap();
    while operation.state() != wanted {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn operation_id(body: &Value) -> String {
    body["data"]["operation_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_empty_history() {
    let app = test_app(two_host_management_pool().build());

    let (status, body) = send(&app.state, "GET", "/api/operations", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_unknown_operation_is_not_found() {
    let app = test_app(two_host_management_pool().build());

    let uri = format!("/api/operations/{}", Uuid::new_v4());
    let (status, body) = send(&app.state, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("not found"));

    let (status, _) = send(&app.state, "GET", "/api/operations/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pools_are_listed() {
    let app = test_app(two_host_management_pool().build());

    let (status, body) = send(&app.state, "GET", "/api/pools", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        json!([{ "name": "lab", "disruption_expected": false }])
    );
}

#[tokio::test(start_paused = true)]
async fn test_network_change_is_launched_and_recorded() {
    let app = test_app(two_host_management_pool().build());
    let request = json!({
        "title": "Move management",
        "bring_up": ["b1"],
        "management": { "new": "b1", "old": "a1" },
        "scope": { "kind": "pool" }
    });

    let (status, body) = send(&app.state, "POST", "/api/pools/lab/network", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    let id = operation_id(&body);
    assert_eq!(body["data"]["title"], "Move management");

    wait_for_state(&app.state, &id, OperationState::Completed).await;

    let (status, body) = send(&app.state, "GET", &format!("/api/operations/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "Completed");
    assert_eq!(body["data"]["percent_complete"], 100);
    assert_eq!(body["data"]["cancel_allowed"], false);
    assert_eq!(body["data"]["connection"], "lab");
    assert_eq!(body["data"]["applies_to"], json!(["h2", "h1"]));

    assert_eq!(
        app.session
            .calls_to(methods::HOST_MANAGEMENT_RECONFIGURE)
            .len(),
        2
    );
    let (_, list) = send(&app.state, "GET", "/api/operations", None).await;
    assert_eq!(list["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_network_changes_on_one_pool_take_turns() {
    let app = test_app(two_host_management_pool().build());
    app.session.script(
        methods::HOST_MANAGEMENT_RECONFIGURE,
        TaskScript::succeed().with_progress(vec![0.3, 0.6]),
    );
    let request = json!({
        "bring_up": ["b1"],
        "management": { "new": "b1", "old": "a1" },
        "scope": { "kind": "pool" }
    });

    let (_, first) = send(&app.state, "POST", "/api/pools/lab/network", Some(request.clone())).await;
    let (_, second) = send(&app.state, "POST", "/api/pools/lab/network", Some(request)).await;
    let first = operation_id(&first);
    let second = operation_id(&second);

    wait_for_state(&app.state, &first, OperationState::Completed).await;
    wait_for_state(&app.state, &second, OperationState::Completed).await;

    assert_eq!(app.session.max_in_flight(), 1);
    assert_eq!(
        app.session
            .calls_to(methods::HOST_MANAGEMENT_RECONFIGURE)
            .len(),
        4
    );
    let (_, pools) = send(&app.state, "GET", "/api/pools", None).await;
    assert_eq!(pools["data"][0]["disruption_expected"], false);
}

#[tokio::test]
async fn test_unresolvable_network_change_is_rejected() {
    let app = test_app(two_host_management_pool().build());
    let request = json!({
        "bring_up": ["no-such-pif"],
        "scope": { "kind": "pool" }
    });

    let (status, body) = send(&app.state, "POST", "/api/pools/lab/network", Some(request)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("no-such-pif"));
    assert!(app.state.history.is_empty().await);
    assert!(app.session.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_pool_is_not_found() {
    let app = test_app(two_host_management_pool().build());
    let request = json!({ "scope": { "kind": "pool" } });

    let (status, _) = send(&app.state, "POST", "/api/pools/nope/network", Some(request)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.state, "POST", "/api/pools/nope/storage/sr-1/scan", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_detach_storage_can_be_cancelled() {
    let app = test_app(
        PoolBuilder::new(&["h1", "h2"])
            .pbd("p1", "h2", "nfs", true)
            .build(),
    );
    app.session.script(methods::PBD_UNPLUG, TaskScript::hang());

    let request = json!({ "hosts": ["h2"] });
    let (status, body) = send(
        &app.state,
        "POST",
        "/api/pools/lab/detach-storage",
        Some(request),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = operation_id(&body);

    wait_for_state(&app.state, &id, OperationState::Running).await;
    let uri = format!("/api/operations/{}/cancel", id);
    let (status, body) = send(&app.state, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    wait_for_state(&app.state, &id, OperationState::Cancelled).await;

    // A finished operation cannot be cancelled again
    let (status, body) = send(&app.state, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test(start_paused = true)]
async fn test_detach_storage_follows_live_snapshot() {
    let app = test_app(
        PoolBuilder::new(&["h1", "h2", "h3"])
            .pbd("p2", "h2", "nfs", true)
            .pbd("p3", "h3", "nfs", true)
            .build(),
    );

    let request = json!({ "hosts": ["h2", "h3"] });
    let (status, body) = send(
        &app.state,
        "POST",
        "/api/pools/lab/detach-storage",
        Some(request),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = operation_id(&body);

    tokio::time::sleep(Duration::from_secs(5)).await;
    app.snapshot
        .update(|s| s.pbds.iter_mut().for_each(|p| p.currently_attached = false));

    wait_for_state(&app.state, &id, OperationState::Completed).await;
    let (_, body) = send(&app.state, "GET", &format!("/api/operations/{}", id), None).await;
    assert_eq!(body["data"]["children"].as_array().map(Vec::len), Some(2));
    assert!(body["data"]["children"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["result"] == "detached"));
    assert_eq!(app.session.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_requests_are_deduplicated() {
    let app = test_app(two_host_management_pool().build());
    app.session.script(methods::SR_SCAN, TaskScript::hang());

    let (status, first) = send(&app.state, "POST", "/api/pools/lab/storage/sr-1/scan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["status"], "started");
    assert!(first["data"]["operation_id"].is_string());

    let (_, again) = send(&app.state, "POST", "/api/pools/lab/storage/sr-1/scan", None).await;
    assert_eq!(again["data"]["status"], "duplicate");
    assert!(again["data"]["operation_id"].is_null());

    let (status, scans) = send(&app.state, "GET", "/api/scans", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scans["data"]["active_keys"], json!(["lab/sr-1"]));
    assert_eq!(scans["data"]["in_flight"]["lab"], 1);

    // scans are internal and never reach the history
    assert!(app.state.history.is_empty().await);
}

#[tokio::test]
async fn test_history_cleanup_endpoint() {
    let app = test_app(two_host_management_pool().build());

    let (status, body) = send(
        &app.state,
        "POST",
        "/api/operations/cleanup?max_hours=1",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cleaned_count"], 0);
}
