//! HTTP routing integration tests
//!
//! Drives the router with `tower::ServiceExt::oneshot`; no socket is bound.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqal_common::config::SqalConfig;
use sqal_fusion::{build_router, AppState};
use std::time::Duration;
use tower::ServiceExt;

const GOOD_SPECTRUM: [f64; 8] = [
    9000.0, 12000.0, 15000.0, 20000.0, 26000.0, 28000.0, 24000.0, 18000.0,
];

fn test_app_state() -> AppState {
    AppState::new(SqalConfig::default())
}

fn depth_frame(sample_id: &str) -> Value {
    let values: Vec<f64> = (0..64).flat_map(|_| [70.0, 30000.0]).collect();
    json!({
        "modality": "depth_array",
        "sensor_id": "tof-01",
        "sample_id": sample_id,
        "raw_values": values,
    })
}

fn spectral_frame(sample_id: &str) -> Value {
    json!({
        "modality": "spectral",
        "sensor_id": "as7341-01",
        "sample_id": sample_id,
        "raw_values": GOOD_SPECTRUM,
    })
}

async fn send(
    state: &AppState,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let app = build_router(state.clone());
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn post_frame(state: &AppState, frame: Value) -> (StatusCode, Value) {
    send(state, Method::POST, "/api/frames", Some(frame)).await
}

/// Open a streaming GET and hand back its body once the handler has run
async fn open_stream(state: &AppState, uri: &str) -> Body {
    let response = build_router(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    response.into_body()
}

/// Read SSE chunks until `needle` shows up
async fn read_until(body: &mut Body, needle: &str) -> String {
    let mut text = String::new();
    while !text.contains(needle) {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("stream stalled")
            .expect("stream ended")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            text.push_str(&String::from_utf8_lossy(&data));
        }
    }
    text
}

#[tokio::test]
async fn test_health_reports_module_and_build() {
    let state = test_app_state();
    let (status, body) = send(&state, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "sqal-fusion");
    assert_eq!(body["build"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["pending_samples"], 0);
}

#[tokio::test]
async fn test_accepted_frame_returns_202() {
    let state = test_app_state();
    let (status, body) = post_frame(&state, depth_frame("S-100")).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["sample_id"], "S-100");
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["missing"], json!(["spectral"]));
}

#[tokio::test]
async fn test_wrong_channel_count_returns_validation_error() {
    let state = test_app_state();
    let mut frame = spectral_frame("S-101");
    frame["raw_values"] = json!([1.0, 2.0, 3.0]);

    let (status, body) = post_frame(&state, frame).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_body_returns_validation_error() {
    let state = test_app_state();
    let app = build_router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/frames")
                .header("content-type", "application/json")
                .body(Body::from("{\"modality\":\"thermal\"}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_complete_sample_is_fused_and_queryable() {
    let state = test_app_state();
    post_frame(&state, depth_frame("S-102")).await;
    let (status, body) = post_frame(&state, spectral_frame("S-102")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "fused");

    let (status, body) = send(&state, Method::GET, "/api/samples/S-102", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "fused");
    assert_eq!(body["result"]["final_grade"], "A");
    assert_eq!(body["result"]["low_confidence"], false);
    assert_eq!(body["result"]["contributing_analyses"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_frame_for_fused_sample_rejected() {
    let state = test_app_state();
    post_frame(&state, depth_frame("S-103")).await;
    post_frame(&state, spectral_frame("S-103")).await;

    let (status, body) = post_frame(&state, spectral_frame("S-103")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_pending_samples_listed() {
    let state = test_app_state();
    post_frame(&state, spectral_frame("S-104")).await;

    let (status, body) = send(&state, Method::GET, "/api/samples", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["samples"][0]["sample_id"], "S-104");
    assert_eq!(body["samples"][0]["received"], json!(["spectral"]));
    assert_eq!(body["samples"][0]["missing"], json!(["depth_array"]));

    let (_, body) = send(&state, Method::GET, "/api/samples/S-104", None).await;
    assert_eq!(body["state"], "waiting");
}

#[tokio::test]
async fn test_force_fuse_partial_sample() {
    let state = test_app_state();
    post_frame(&state, spectral_frame("S-105")).await;

    let (status, body) = send(&state, Method::POST, "/api/samples/S-105/fuse", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["missing_modalities"], json!(["depth_array"]));
    assert_eq!(body["composite_score"], 1.0);

    // Idempotent
    let (status, again) = send(&state, Method::POST, "/api/samples/S-105/fuse", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body);
}

#[tokio::test]
async fn test_force_fuse_unknown_sample_is_404() {
    let state = test_app_state();
    let (status, body) = send(&state, Method::POST, "/api/samples/NOPE/fuse", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_lifecycle() {
    let state = test_app_state();
    post_frame(&state, depth_frame("S-106")).await;

    let (status, body) = send(&state, Method::DELETE, "/api/samples/S-106", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, _) = send(&state, Method::DELETE, "/api/samples/S-106", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&state, Method::DELETE, "/api/samples/UNKNOWN", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_after_fusion_returns_result() {
    let state = test_app_state();
    post_frame(&state, depth_frame("S-107")).await;
    post_frame(&state, spectral_frame("S-107")).await;

    let (status, body) = send(&state, Method::DELETE, "/api/samples/S-107", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "fused");
    assert_eq!(body["result"]["sample_id"], "S-107");
}

#[tokio::test]
async fn test_stats_count_frames() {
    let state = test_app_state();
    post_frame(&state, depth_frame("S-108")).await;
    post_frame(&state, spectral_frame("S-108")).await;
    let mut bad = depth_frame("S-109");
    bad["sensor_id"] = json!("");
    post_frame(&state, bad).await;

    let (status, body) = send(&state, Method::GET, "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["frames_received"], 3);
    assert_eq!(body["frames_accepted"], 2);
    assert_eq!(body["frames_rejected"], 1);
    assert_eq!(body["fusion"]["fused"], 1);
}

#[tokio::test]
async fn test_expect_sample_opens_wait() {
    let state = test_app_state();

    let (status, body) = send(&state, Method::PUT, "/api/samples/S-120", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["sample_id"], "S-120");
    assert_eq!(body["state"], "waiting");

    let (status, _) = send(&state, Method::PUT, "/api/samples/S-120", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&state, Method::GET, "/api/samples/S-120", None).await;
    assert_eq!(body["state"], "waiting");

    post_frame(&state, depth_frame("S-120")).await;
    post_frame(&state, spectral_frame("S-120")).await;
    let (status, body) = send(&state, Method::PUT, "/api/samples/S-120", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_blank_sample_id_is_bad_request() {
    let state = test_app_state();
    let (status, body) = send(&state, Method::GET, "/api/samples/%20", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_result_stream_delivers_fused_sample() {
    let state = test_app_state();
    let mut body = open_stream(&state, "/results/stream").await;

    let (_, consumers) = send(&state, Method::GET, "/api/consumers", None).await;
    assert_eq!(consumers.as_array().unwrap().len(), 1);
    assert_eq!(consumers[0]["dropped_count"], 0);

    post_frame(&state, depth_frame("S-121")).await;
    post_frame(&state, spectral_frame("S-121")).await;

    let text = read_until(&mut body, "S-121").await;
    assert!(text.contains("event: result"));
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("no data line");
    let message: Value = serde_json::from_str(data).unwrap();
    assert_eq!(message["type"], "result");
    assert_eq!(message["sample_id"], "S-121");
    assert_eq!(message["final_grade"], "A");

    // Closing the stream releases the consumer
    drop(body);
    let (_, consumers) = send(&state, Method::GET, "/api/consumers", None).await;
    assert_eq!(consumers, json!([]));
}

#[tokio::test]
async fn test_event_stream_reports_lifecycle() {
    let state = test_app_state();
    let mut body = open_stream(&state, "/events").await;

    let mut bad = spectral_frame("S-122");
    bad["raw_values"] = json!([1.0]);
    post_frame(&state, bad).await;
    post_frame(&state, depth_frame("S-122")).await;
    post_frame(&state, spectral_frame("S-122")).await;

    let text = read_until(&mut body, "event: SampleFused").await;
    assert!(text.contains("event: FrameRejected"));
    assert!(text.contains("event: AnalysisRecorded"));
    assert!(text.contains("\"sample_id\":\"S-122\""));
}
