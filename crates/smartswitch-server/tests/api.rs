//! End-to-end tests of the control API against a simulated switch.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use smartswitch_core::{
    KeepAliveHost, LoopConfig, MockScript, MockTransport, NoopLease, OngoingNotice, Step,
    TracingIndicator, Transport, TransportCall,
};
use smartswitch_server::api::create_router;
use smartswitch_server::state::AppState;

struct Harness {
    server: TestServer,
    transport: Arc<MockTransport>,
}

fn harness(script: MockScript) -> Harness {
    let transport = Arc::new(MockTransport::with_script(script));
    let host = KeepAliveHost::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Box::new(NoopLease::new()),
        Arc::new(TracingIndicator),
        LoopConfig::default(),
        OngoingNotice::default(),
    );
    let app = create_router(AppState::new(Arc::new(host)));
    Harness {
        server: TestServer::new(app).unwrap(),
        transport,
    }
}

#[tokio::test]
async fn test_health_reports_loop_state() {
    let h = harness(MockScript::default());

    let response = h.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["loop_state"], "not_started");
}

#[tokio::test]
async fn test_start_status_stop_cycle() {
    let h = harness(MockScript::default());

    let response = h
        .server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "aa:bb:cc:dd:ee:ff" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["result"], "started");
    assert_eq!(body["status"]["state"], "running");
    assert_eq!(body["status"]["address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(body["status"]["lease_held"], true);
    assert_eq!(body["status"]["notice"]["title"], "Smart Dorm Active");
    assert_eq!(body["status"]["notice"]["priority"], "max");

    // One simulated attempt takes a few tens of milliseconds.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status: Value = h.server.get("/api/keepalive/status").await.json();
    assert_eq!(status["stats"]["successes"], 1);
    assert_eq!(status["stats"]["last_outcome"], "success");

    let response = h.server.post("/api/keepalive/stop").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["stopped"], true);
    assert_eq!(body["status"]["state"], "stopped");
    assert_eq!(body["status"]["lease_held"], false);
    assert!(body["status"]["address"].is_null());
    assert_eq!(h.transport.open_sessions(), 0);

    let body: Value = h.server.post("/api/keepalive/stop").await.json();
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn test_start_is_idempotent_and_switches_address() {
    let h = harness(MockScript::default());

    h.server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "AA:BB:CC:DD:EE:FF" }))
        .await
        .assert_status_ok();

    let body: Value = h
        .server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "AA:BB:CC:DD:EE:FF" }))
        .await
        .json();
    assert_eq!(body["result"], "already_running");

    let body: Value = h
        .server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "11:22:33:44:55:66" }))
        .await
        .json();
    assert_eq!(body["result"], "restarted");
    assert_eq!(body["previous_address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(body["status"]["address"], "11:22:33:44:55:66");

    h.server.post("/api/keepalive/stop").await.assert_status_ok();
}

#[tokio::test]
async fn test_start_rejects_invalid_address() {
    let h = harness(MockScript::default());

    let response = h
        .server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "not-a-mac" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_bluetooth_address");

    let status: Value = h.server.get("/api/keepalive/status").await.json();
    assert_eq!(status["state"], "not_started");
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_stop_mid_attempt_force_closes_connection() {
    let h = harness(MockScript {
        discover: Step::Hang,
        ..MockScript::default()
    });

    h.server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "AA:BB:CC:DD:EE:FF" }))
        .await
        .assert_status_ok();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.open_sessions(), 1);

    h.server.post("/api/keepalive/stop").await.assert_status_ok();
    assert_eq!(h.transport.open_sessions(), 0);
    assert_eq!(h.transport.count(|c| *c == TransportCall::Disconnect), 1);

    // A fresh start begins a new cycle straight away.
    h.server
        .post("/api/keepalive/start")
        .json(&json!({ "address": "AA:BB:CC:DD:EE:FF" }))
        .await
        .assert_status_ok();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Connect(_))), 2);

    h.server.post("/api/keepalive/stop").await.assert_status_ok();
}

#[tokio::test]
async fn test_openapi_document_served() {
    let h = harness(MockScript::default());

    let response = h.server.get("/api/openapi.json").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["info"]["title"], "smartswitch API");
    assert!(body["paths"]["/api/keepalive/status"].is_object());
}
