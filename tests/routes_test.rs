mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

use common::{engine_config, FakeConnectivity, FakeHttp, FakeSockets};
use vpn_diagnostics::network::InterfaceKind;
use vpn_diagnostics::server::build_router;
use vpn_diagnostics::state::{EngineParts, EngineState, SharedState};
use vpn_diagnostics::store::MemoryStore;

fn test_state(http: FakeHttp) -> (TempDir, SharedState) {
    let dir = TempDir::new().unwrap();
    let config = engine_config(dir.path().to_path_buf());
    let parts = EngineParts {
        connectivity: Arc::new(FakeConnectivity::with(&[InterfaceKind::Ethernet])),
        http: Arc::new(http),
        sockets: Arc::new(FakeSockets::new()),
        kv: Arc::new(MemoryStore::new()),
    };
    (dir, Arc::new(EngineState::from_parts(&config, parts)))
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (_dir, state) = test_state(FakeHttp::new());
    let (status, body) = send(build_router(state), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["speed_test_running"], false);
    assert_eq!(body["history_max"], 20);
}

#[tokio::test]
async fn test_run_diagnostics_records_report() {
    let (_dir, state) = test_state(FakeHttp::new());
    let router = build_router(state.clone());

    let (status, body) = send(
        router.clone(),
        post_json(
            "/diagnostics/run",
            serde_json::json!({ "target": "vpn.example.com:443", "serverName": "Berlin" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target"], "Berlin (vpn.example.com:443)");
    let steps = body["result"]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 6);
    assert_eq!(steps[0]["name"], "network-connectivity");
    assert_eq!(steps[0]["status"], "success");

    let (status, recent) = send(router, get("/diagnostics/recent")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recent["total"], 1);
    assert_eq!(recent["reports"][0]["id"], body["id"]);
}

#[tokio::test]
async fn test_invalid_target_is_bad_request() {
    let (_dir, state) = test_state(FakeHttp::new());
    let (status, body) = send(
        build_router(state),
        post_json("/diagnostics/run", serde_json::json!({ "target": "no-port" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("no-port"));
}

#[tokio::test]
async fn test_clear_recent_diagnostics() {
    let (_dir, state) = test_state(FakeHttp::new());
    let router = build_router(state.clone());
    send(router.clone(), post_json("/diagnostics/run", serde_json::json!({}))).await;

    let (status, _) = send(router.clone(), delete("/diagnostics/recent")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.journal.read().await.is_empty());
}

#[tokio::test]
async fn test_speed_test_saves_history() {
    let (_dir, state) = test_state(FakeHttp::new());
    let router = build_router(state);

    let (status, result) = send(
        router.clone(),
        post_json(
            "/speed-test",
            serde_json::json!({ "vpnActive": true, "serverName": "Lisbon" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["serverName"], "Lisbon");
    assert_eq!(result["vpnActive"], true);

    let (status, history) = send(router.clone(), get("/speed-test/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["total"], 1);
    assert_eq!(history["results"][0]["serverName"], "Lisbon");

    let (status, _) = send(router.clone(), delete("/speed-test/history")).await;
    assert_eq!(status, StatusCode::OK);
    let (_, history) = send(router, get("/speed-test/history")).await;
    assert_eq!(history["total"], 0);
}

#[tokio::test]
async fn test_speed_test_in_progress_is_conflict() {
    let gate = Arc::new(Notify::new());
    let (_dir, state) = test_state(FakeHttp::new().with_download_gate(gate.clone()));
    let router = build_router(state.clone());

    let running = {
        let router = router.clone();
        tokio::spawn(async move {
            send(router, post_json("/speed-test", serde_json::json!({}))).await
        })
    };
    while !state.probe.is_running() {
        tokio::task::yield_now().await;
    }

    let (status, body) = send(router.clone(), post_json("/speed-test", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Speed test already in progress");

    let (status, _) = send(router, get("/speed-test/stream")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    gate.notify_one();
    let (status, _) = running.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_log_history_records_activity() {
    let (_dir, state) = test_state(FakeHttp::new());
    let router = build_router(state);
    send(router.clone(), post_json("/speed-test", serde_json::json!({}))).await;

    let (status, logs) = send(router, get("/logs/history?source=speed_test")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = logs["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["source"], "speed_test");
}

async fn body_text(router: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), 1024 * 1024),
    )
    .await
    .expect("stream should end")
    .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_speed_test_stream_runs_to_completion() {
    let (_dir, state) = test_state(FakeHttp::new());
    let (status, body) = body_text(
        build_router(state.clone()),
        get("/speed-test/stream?vpnActive=true&serverName=Oslo"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: progress"));
    assert!(body.contains(r#""type":"completed""#));
    assert!(body.contains(r#""serverName":"Oslo""#));
    assert!(!state.probe.is_running());
    assert_eq!(state.history.get_history().await.len(), 1);
}

#[tokio::test]
async fn test_speed_test_stream_rejected_while_slot_is_held() {
    let (_dir, state) = test_state(FakeHttp::new());
    let router = build_router(state.clone());

    let permit = state.probe.try_reserve().unwrap();
    let (status, body) = send(router.clone(), get("/speed-test/stream")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Speed test already in progress");

    drop(permit);
    let (status, _) = body_text(router, get("/speed-test/stream")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_log_stream_ends_on_shutdown() {
    let (_dir, state) = test_state(FakeHttp::new());
    let response = build_router(state.clone())
        .oneshot(get("/logs/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.shutdown();
    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), 1024 * 1024),
    )
    .await
    .expect("log stream should close after shutdown");
    assert!(body.is_ok());
}
