//! Live result delivery
//!
//! `GET /ws/results` pushes one JSON message per fused sample and accepts
//! `{"action":"ack","sample_id":"..."}` from the client. `GET /results/stream`
//! carries the same messages over SSE.
//!
//! Each connection owns one delivery queue; closing the connection
//! unsubscribes it. `GET /api/consumers` lists the live queues.

use crate::delivery::ConsumerSnapshot;
use crate::pipeline::Subscription;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqal_common::types::{FusionResult, ResultMessage};
use sqal_common::SampleId;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// Server → client message on the results socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Result(ResultMessage),
    /// Results were dropped from this consumer's queue since the last notice
    Dropped { dropped_count: u64 },
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Client → server command on the results socket
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Ack { sample_id: SampleId },
}

/// Messages to send for one dequeued result, including a drop notice when
/// the queue overflowed since `reported_drops`
fn messages_for(
    result: &FusionResult,
    dropped_count: u64,
    reported_drops: &mut u64,
) -> Vec<StreamMessage> {
    let mut messages = Vec::with_capacity(2);
    if dropped_count > *reported_drops {
        *reported_drops = dropped_count;
        messages.push(StreamMessage::Dropped { dropped_count });
    }
    messages.push(StreamMessage::Result(ResultMessage::from(result)));
    messages
}

/// GET /ws/results
pub async fn results_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_results_socket(socket, state))
}

async fn handle_results_socket(socket: WebSocket, state: AppState) {
    let subscription = Arc::new(state.pipeline.subscribe("websocket"));
    let (mut sender, mut receiver) = socket.split();
    let heartbeat = state.heartbeat_interval();

    let forward = Arc::clone(&subscription);
    let shutdown = state.shutdown.clone();
    let mut forward_task = tokio::spawn(async move {
        let mut reported_drops = 0u64;
        loop {
            let messages = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = forward.recv() => match result {
                    Some(result) => {
                        messages_for(&result, forward.dropped_count(), &mut reported_drops)
                    }
                    None => break,
                },
                _ = tokio::time::sleep(heartbeat) => {
                    vec![StreamMessage::Heartbeat { timestamp: Utc::now() }]
                }
            };

            for message in messages {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize stream message: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    // Send failure means the client is gone
                    return;
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut forward_task => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_client_command(&text, &subscription),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Results WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    forward_task.abort();
    debug!("Results WebSocket for consumer {} closed", subscription.id());
}

fn handle_client_command(text: &str, subscription: &Subscription) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Ack { sample_id }) => {
            debug!("Consumer {} acknowledged {}", subscription.id(), sample_id);
            subscription.ack(sample_id);
        }
        Err(e) => warn!("Ignoring unrecognized client command: {}", e),
    }
}

/// GET /results/stream
pub async fn result_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.pipeline.subscribe("sse");
    let heartbeat = state.heartbeat_interval();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let mut reported_drops = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = subscription.recv() => {
                    let Some(result) = result else { break };
                    let dropped_count = subscription.dropped_count();
                    for message in messages_for(&result, dropped_count, &mut reported_drops) {
                        let event_type = match &message {
                            StreamMessage::Result(_) => "result",
                            StreamMessage::Dropped { .. } => "dropped",
                            StreamMessage::Heartbeat { .. } => "heartbeat",
                        };
                        match serde_json::to_string(&message) {
                            Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                            Err(e) => warn!("SSE: Failed to serialize result: {}", e),
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}

/// GET /api/consumers
pub async fn list_consumers(State(state): State<AppState>) -> Json<Vec<ConsumerSnapshot>> {
    Json(state.pipeline.delivery().consumers())
}

/// Build result delivery routes
pub fn result_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/results", get(results_socket))
        .route("/results/stream", get(result_stream))
        .route("/api/consumers", get(list_consumers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqal_common::Grade;

    fn result() -> FusionResult {
        FusionResult {
            sample_id: SampleId::from("S-1"),
            final_grade: Grade::C,
            composite_score: 0.45,
            contributing_analyses: Vec::new(),
            missing_modalities: Vec::new(),
            disagreement: 0.0,
            low_confidence: false,
            fused_at: Utc::now(),
        }
    }

    #[test]
    fn test_ack_command_parses() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"action":"ack","sample_id":"S-42"}"#).unwrap();
        assert_eq!(command, ClientCommand::Ack { sample_id: SampleId::from("S-42") });
        assert!(serde_json::from_str::<ClientCommand>(r#"{"action":"pause"}"#).is_err());
    }

    #[test]
    fn test_drop_notice_sent_once_per_increase() {
        let mut reported = 0;
        let first = messages_for(&result(), 2, &mut reported);
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0], StreamMessage::Dropped { dropped_count: 2 }));

        let second = messages_for(&result(), 2, &mut reported);
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], StreamMessage::Result(_)));
    }

    #[test]
    fn test_result_message_shape() {
        let message = StreamMessage::Result(ResultMessage::from(&result()));
        let json = serde_json::to_value(message).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["sample_id"], "S-1");
        assert_eq!(json["final_grade"], "C");
        assert_eq!(json["low_confidence"], false);
    }
}
