//! Server-Sent Events for service lifecycle notifications
//!
//! Streams every [`SqalEvent`] (rejections, fusions, discards, cancellations,
//! consumer churn). Fused results themselves go through `/results/stream`.

use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to service events");

    let mut rx = state.event_bus.subscribe();
    let heartbeat = state.heartbeat_interval();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = tokio::time::sleep(heartbeat) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => match received {
                    Ok(event) => {
                        let event_type = event.event_type();
                        match serde_json::to_string(&event) {
                            Ok(event_json) => {
                                yield Ok(Event::default().event(event_type).data(event_json));
                            }
                            Err(e) => {
                                warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("SSE: Event client lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("SSE: Service event stream ended");
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}
