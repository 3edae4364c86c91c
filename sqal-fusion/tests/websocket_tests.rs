//! WebSocket integration tests
//!
//! Serves the router on an ephemeral local port and talks to it with a real
//! WebSocket client.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sqal_common::config::SqalConfig;
use sqal_common::SampleId;
use sqal_fusion::{build_router, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const GOOD_SPECTRUM: [f64; 8] = [
    9000.0, 12000.0, 15000.0, 20000.0, 26000.0, 28000.0, 24000.0, 18000.0,
];

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

async fn serve(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (socket, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    socket
}

/// Next text message as JSON, skipping control frames
async fn next_json(socket: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no message within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut Client, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn test_ingest_socket_replies_per_frame() {
    let state = AppState::new(SqalConfig::default());
    let addr = serve(state.clone()).await;
    let mut socket = connect(addr, "/ws/ingest").await;

    send_json(&mut socket, depth_frame("S-300")).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "ack");
    assert_eq!(reply["sample_id"], "S-300");
    assert_eq!(reply["status"], "waiting");
    assert_eq!(reply["missing"], json!(["spectral"]));

    socket
        .send(Message::Text("{\"modality\":\"thermal\"}".to_string()))
        .await
        .unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "VALIDATION_ERROR");

    // A bad frame does not end the session
    send_json(&mut socket, spectral_frame("S-300")).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "ack");
    assert_eq!(reply["status"], "fused");

    let stats = state.pipeline.stats();
    assert_eq!(stats.frames_accepted, 2);
    assert_eq!(stats.frames_rejected, 1);
}

#[tokio::test]
async fn test_results_socket_push_ack_and_disconnect() {
    let state = AppState::new(SqalConfig::default());
    let addr = serve(state.clone()).await;
    let mut socket = connect(addr, "/ws/results").await;
    wait_until(|| state.pipeline.stats().consumers == 1).await;

    state.pipeline.handle_text(&depth_frame("S-301").to_string()).unwrap();
    state.pipeline.handle_text(&spectral_frame("S-301").to_string()).unwrap();

    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "result");
    assert_eq!(message["sample_id"], "S-301");
    assert_eq!(message["final_grade"], "A");
    assert_eq!(message["sub_scores"].as_array().unwrap().len(), 2);

    send_json(&mut socket, json!({"action": "ack", "sample_id": "S-301"})).await;
    wait_until(|| {
        let consumers = state.pipeline.delivery().consumers();
        consumers.len() == 1 && consumers[0].last_acked == Some(SampleId::from("S-301"))
    })
    .await;

    socket.close(None).await.unwrap();
    wait_until(|| state.pipeline.stats().consumers == 0).await;
    assert!(state.pipeline.delivery().consumers().is_empty());
}

#[tokio::test]
async fn test_results_socket_ignores_unknown_commands() {
    let state = AppState::new(SqalConfig::default());
    let addr = serve(state.clone()).await;
    let mut socket = connect(addr, "/ws/results").await;
    wait_until(|| state.pipeline.stats().consumers == 1).await;

    send_json(&mut socket, json!({"action": "rewind"})).await;
    state.pipeline.handle_text(&depth_frame("S-302").to_string()).unwrap();
    state.pipeline.handle_text(&spectral_frame("S-302").to_string()).unwrap();

    let message = next_json(&mut socket).await;
    assert_eq!(message["sample_id"], "S-302");
    assert_eq!(state.pipeline.delivery().consumers()[0].last_acked, None);
}
