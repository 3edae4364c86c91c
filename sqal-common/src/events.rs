//! Event system for SQAL services
//!
//! Provides the shared service event definitions and the EventBus used to
//! broadcast them (SSE `/events`, logging bridges, tests).
//!
//! Fused results themselves do not travel over the EventBus. They go through
//! the bounded per-consumer queues of the delivery channel; the bus only
//! carries lifecycle notifications.

use crate::types::{Grade, Modality, SampleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// SQAL service event types
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SqalEvent {
    /// A frame failed ingestion validation
    FrameRejected {
        sensor_id: String,
        sample_id: SampleId,
        modality: Modality,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A modality analysis was recorded against a waiting sample
    AnalysisRecorded {
        sample_id: SampleId,
        modality: Modality,
        sub_score: f64,
        confidence: f64,
        unreliable: bool,
        timestamp: DateTime<Utc>,
    },

    /// A sample reached the FUSED state
    SampleFused {
        sample_id: SampleId,
        grade: Grade,
        composite_score: f64,
        low_confidence: bool,
        /// True when fusion ran on a partial set after the wait expired
        partial: bool,
        timestamp: DateTime<Utc>,
    },

    /// A sample timed out without a single analysis (missed sample)
    SampleDiscarded {
        sample_id: SampleId,
        timestamp: DateTime<Utc>,
    },

    /// A waiting sample was withdrawn before fusion
    SampleCancelled {
        sample_id: SampleId,
        timestamp: DateTime<Utc>,
    },

    /// A live result consumer subscribed
    ConsumerConnected {
        consumer_id: Uuid,
        transport: String,
        timestamp: DateTime<Utc>,
    },

    /// A live result consumer went away
    ConsumerDisconnected {
        consumer_id: Uuid,
        dropped_count: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SqalEvent {
    /// Event type name, used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            SqalEvent::FrameRejected { .. } => "FrameRejected",
            SqalEvent::AnalysisRecorded { .. } => "AnalysisRecorded",
            SqalEvent::SampleFused { .. } => "SampleFused",
            SqalEvent::SampleDiscarded { .. } => "SampleDiscarded",
            SqalEvent::SampleCancelled { .. } => "SampleCancelled",
            SqalEvent::ConsumerConnected { .. } => "ConsumerConnected",
            SqalEvent::ConsumerDisconnected { .. } => "ConsumerDisconnected",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for service-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use sqal_common::events::{EventBus, SqalEvent};
/// use sqal_common::SampleId;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(SqalEvent::SampleDiscarded {
///     sample_id: SampleId::from("S-1"),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().event_type(), "SampleDiscarded");
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SqalEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered before the oldest are
    /// dropped for lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<SqalEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SqalEvent) -> Result<usize, broadcast::error::SendError<SqalEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SqalEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(10);
        let result = bus.emit(SqalEvent::SampleCancelled {
            sample_id: SampleId::from("S-1"),
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let delivered = bus
            .emit(SqalEvent::SampleFused {
                sample_id: SampleId::from("S-7"),
                grade: Grade::A,
                composite_score: 0.91,
                low_confidence: false,
                partial: false,
                timestamp: Utc::now(),
            })
            .unwrap();
        assert_eq!(delivered, 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                SqalEvent::SampleFused { sample_id, grade, .. } => {
                    assert_eq!(sample_id.as_str(), "S-7");
                    assert_eq!(grade, Grade::A);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SqalEvent::FrameRejected {
            sensor_id: "as7341-01".to_string(),
            sample_id: SampleId::from("S-3"),
            modality: Modality::Spectral,
            reason: "channel count 7, expected 8".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FrameRejected");
        assert_eq!(json["modality"], "spectral");
        assert_eq!(event.event_type(), "FrameRejected");
    }
}
