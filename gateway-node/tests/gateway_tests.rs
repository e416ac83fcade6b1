//! Router-level tests for the gateway: membership, selection, limiter
//! gating, forwarding, and announcement management, driven through the
//! public HTTP surface.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use gateway_node::{build, Gateway, GatewayConfig};

fn gateway() -> Gateway {
    build(GatewayConfig::default(), CancellationToken::new())
}

fn gateway_with(mutate: impl FnOnce(&mut GatewayConfig)) -> Gateway {
    let mut config = GatewayConfig::default();
    mutate(&mut config);
    build(config, CancellationToken::new())
}

async fn send_json(
    gateway: &Gateway,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let request = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(body.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = gateway.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn worker_record(id: &str, engine: &str, port: u16, ready: bool) -> Value {
    json!({
        "node_id": id,
        "engine": engine,
        "host": "127.0.0.1",
        "port": port,
        "state": if ready { "ready" } else { "standby" },
        "model_loaded": ready,
    })
}

async fn register(gateway: &Gateway, record: Value) {
    let (status, body) = send_json(gateway, "POST", "/api/nodes/register", Some(record)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

/// Spawn a stub worker that answers `/synthesize` with a fixed WAV-sized
/// payload and `/extract_voice` with a JSON verdict. Returns its port.
async fn spawn_stub_worker(audio_len: usize) -> u16 {
    let app = Router::new()
        .route(
            "/synthesize",
            post(move || async move {
                ([(header::CONTENT_TYPE, "audio/wav")], vec![0u8; audio_len]).into_response()
            }),
        )
        .route(
            "/extract_voice",
            post(|| async {
                axum::Json(json!({
                    "success": true,
                    "voice_id": "voice001",
                    "voice_name": "stub",
                    "engine": "xtts",
                }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn membership_scenario() {
    let gateway = gateway();
    register(
        &gateway,
        worker_record("abc12345", "xtts", 8001, true),
    )
    .await;

    let (status, body) = send_json(&gateway, "GET", "/api/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(body["nodes"][0]["node_id"], "abc12345");

    let stats = gateway.state.registry.stats().await;
    assert_eq!((stats.total, stats.online, stats.ready), (1, 1, 1));
    let engines = serde_json::to_value(&stats.engines).unwrap();
    assert_eq!(engines["xtts"]["ready"], 1);
    assert_eq!(engines["openvoice"]["total"], 0);
    assert_eq!(engines["gpt-sovits"]["total"], 0);
}

#[tokio::test]
async fn get_unknown_node_is_404() {
    let gateway = gateway();
    let (status, body) = send_json(&gateway, "GET", "/api/nodes/zzzz9999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NODE_NOT_FOUND");
}

#[tokio::test]
async fn list_nodes_rejects_unknown_engine() {
    let gateway = gateway();
    let (status, body) = send_json(&gateway, "GET", "/api/nodes?engine=tacotron", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let gateway = gateway();
    register(&gateway, worker_record("abc12345", "xtts", 8001, true)).await;

    let (status, body) = send_json(&gateway, "DELETE", "/api/nodes/abc12345", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = send_json(&gateway, "DELETE", "/api/nodes/abc12345", None).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn heartbeat_updates_record() {
    let gateway = gateway();
    register(&gateway, worker_record("abc12345", "xtts", 8001, false)).await;

    let report = json!({
        "state": "ready",
        "model_loaded": true,
        "cpu_percent": 33.0,
        "memory_percent": 50.0,
        "current_concurrent": 1,
        "request_count": 4,
        "error_count": 0,
        "avg_response_ms": 210.0,
    });
    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/nodes/abc12345/heartbeat",
        Some(report),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, node) = send_json(&gateway, "GET", "/api/nodes/abc12345", None).await;
    assert_eq!(node["state"], "ready");
    assert_eq!(node["model_loaded"], true);
    assert_eq!(node["request_count"], 4);

    // Heartbeats for unknown ids are dropped, not errors.
    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/nodes/ffff0000/heartbeat",
        Some(json!({"state": "ready"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn health_reflects_fleet_state() {
    let gateway = gateway();

    let (status, body) = send_json(&gateway, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unhealthy");

    register(&gateway, worker_record("aaaa0001", "xtts", 8001, false)).await;
    let (_, body) = send_json(&gateway, "GET", "/health", None).await;
    assert_eq!(body["status"], "degraded");

    register(&gateway, worker_record("aaaa0002", "xtts", 8002, true)).await;
    let (_, body) = send_json(&gateway, "GET", "/health", None).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["registry"]["ready_nodes"], 1);
    assert!(body["components"]["limiter"]["concurrent_limit"].is_u64());
}

#[tokio::test]
async fn synthesize_validation_boundaries() {
    let gateway = gateway();

    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/synthesize",
        Some(json!({"text": "", "voice_id": "v"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, _) = send_json(
        &gateway,
        "POST",
        "/api/synthesize",
        Some(json!({"text": "hello", "voice_id": "v", "speed": 0.49})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // speed exactly at the lower bound is accepted; with no workers the
    // request then reports no available node in the legacy 200 shape.
    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/synthesize",
        Some(json!({"text": "hello", "voice_id": "v", "speed": 0.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "NO_AVAILABLE_NODE");
}

#[tokio::test]
async fn synthesize_forwards_audio_with_node_headers() {
    let gateway = gateway();
    let port = spawn_stub_worker(12000).await;
    register(&gateway, worker_record("abc12345", "xtts", port, true)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/synthesize")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"text": "hello", "voice_id": "v"}).to_string(),
        ))
        .unwrap();
    let response = gateway.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "audio/wav"
    );
    assert_eq!(response.headers().get("x-node-id").unwrap(), "abc12345");
    assert_eq!(response.headers().get("x-engine").unwrap(), "xtts");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.len(), 12000);
}

#[tokio::test]
async fn synthesize_transport_failure_is_bad_gateway() {
    let gateway = gateway();
    // Nothing listens on this port.
    register(&gateway, worker_record("abc12345", "xtts", 1, true)).await;

    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/synthesize",
        Some(json!({"text": "hello", "voice_id": "v"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn batch_synthesize_reports_partial_failure() {
    let gateway = gateway();
    let port = spawn_stub_worker(256).await;
    register(&gateway, worker_record("abc12345", "xtts", port, true)).await;

    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/batch_synthesize",
        Some(json!({
            "texts": ["one", "two", ""],
            "voice_id": "v",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["succeeded"], 2);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["success"], false);
    assert_eq!(body["results"][0]["size"], 256);
    assert_eq!(body["results"][2]["success"], false);
}

#[tokio::test]
async fn extract_voice_passes_worker_verdict_through() {
    let gateway = gateway();
    let port = spawn_stub_worker(0).await;
    register(&gateway, worker_record("abc12345", "xtts", port, true)).await;

    let boundary = "voicemesh-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"ref.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFFfake\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"voice_name\"\r\n\r\nTester\r\n--{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/extract_voice")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = gateway.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["success"], true);
    assert_eq!(value["voice_id"], "voice001");
}

#[tokio::test]
async fn extract_voice_without_audio_is_rejected() {
    let gateway = gateway();
    let boundary = "voicemesh-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"voice_name\"\r\n\r\nTester\r\n--{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/extract_voice")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = gateway.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sixth_request_from_one_ip_is_rate_limited() {
    let gateway = gateway_with(|config| config.limits.ip_rpm = 5);

    for _ in 0..5 {
        let request = Request::builder()
            .method("GET")
            .uri("/api/nodes")
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        let response = gateway.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder()
        .method("GET")
        .uri("/api/nodes")
        .header("x-forwarded-for", "1.2.3.4")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn health_bypasses_rate_limiter() {
    let gateway = gateway_with(|config| {
        config.limits.global_rpm = 1;
        config.limits.ip_rpm = 1;
    });

    for _ in 0..5 {
        let (status, _) = send_json(&gateway, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn announcements_crud_and_status_inclusion() {
    let gateway = gateway();

    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/announcements",
        Some(json!({
            "severity": "maintenance",
            "title": "GPU pool drain",
            "message": "xtts workers drain at 02:00 UTC",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 8);

    let (_, body) = send_json(&gateway, "GET", "/api/announcements", None).await;
    assert_eq!(body["announcements"].as_array().unwrap().len(), 1);

    let (_, body) = send_json(&gateway, "GET", "/api/status", None).await;
    assert_eq!(body["announcements"][0]["severity"], "maintenance");
    assert_eq!(body["total_nodes"], 0);

    let (_, body) = send_json(&gateway, "DELETE", &format!("/api/announcements/{id}"), None).await;
    assert_eq!(body["success"], true);
    let (_, body) = send_json(&gateway, "GET", "/api/announcements", None).await;
    assert!(body["announcements"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn command_to_unknown_node_is_404() {
    let gateway = gateway();
    let (status, body) = send_json(
        &gateway,
        "POST",
        "/api/nodes/zzzz9999/command",
        Some(json!({"command": "activate"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NODE_NOT_FOUND");
}
