//! Frame ingestion endpoints
//!
//! - `POST /api/frames`: one frame payload per request
//! - `GET /ws/ingest`: one frame payload per text message, one reply each

use crate::error::ApiResult;
use crate::ingest::ValidationError;
use crate::pipeline::FrameAck;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Per-frame reply on the ingest WebSocket
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestReply {
    Ack(FrameAck),
    Error { code: &'static str, message: String },
}

impl From<Result<FrameAck, ValidationError>> for IngestReply {
    fn from(outcome: Result<FrameAck, ValidationError>) -> Self {
        match outcome {
            Ok(ack) => IngestReply::Ack(ack),
            Err(err) => IngestReply::Error {
                code: "VALIDATION_ERROR",
                message: err.to_string(),
            },
        }
    }
}

/// POST /api/frames
///
/// Returns 202 with the frame acknowledgement; 400 `VALIDATION_ERROR` when
/// the frame is refused. The body is decoded here rather than by the `Json`
/// extractor so malformed payloads get the same error shape.
pub async fn submit_frame(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<(StatusCode, Json<FrameAck>)> {
    let ack = state.pipeline.handle_text(&body)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// GET /ws/ingest
pub async fn ingest_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ingest_socket(socket, state))
}

async fn handle_ingest_socket(socket: WebSocket, state: AppState) {
    info!("Sensor connected to ingest WebSocket");
    let (mut sender, mut receiver) = socket.split();
    let mut frames = 0u64;

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary message on ingest socket");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("Ingest WebSocket error: {}", e);
                break;
            }
        };

        frames += 1;
        let reply = IngestReply::from(state.pipeline.handle_text(&text));
        match serde_json::to_string(&reply) {
            Ok(json) => {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Failed to serialize ingest reply: {}", e),
        }
    }

    info!("Sensor disconnected from ingest WebSocket after {} frames", frames);
}

/// Build frame ingestion routes
pub fn frame_routes() -> Router<AppState> {
    Router::new()
        .route("/api/frames", post(submit_frame))
        .route("/ws/ingest", get(ingest_socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FrameStatus;
    use sqal_common::{Modality, SampleId};

    #[test]
    fn test_reply_serialization() {
        let ack = IngestReply::from(Ok(FrameAck {
            sample_id: SampleId::from("S-1"),
            modality: Modality::Spectral,
            status: FrameStatus::Waiting,
            missing: vec![Modality::DepthArray],
        }));
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["missing"][0], "depth_array");

        let err = IngestReply::from(Err(ValidationError::MissingSensorId));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "VALIDATION_ERROR");
    }
}
