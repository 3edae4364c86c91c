//! Ingestion → analysis → fusion → delivery
//!
//! [`Pipeline`] is the single entry point used by every transport (HTTP,
//! WebSocket, simulator). Frames are validated and analyzed inline on the
//! caller's task; the only suspension point is the per-sample wait, which
//! runs as its own task racing the configured timeout against the sample's
//! cancellation token.

use crate::analyzers::Analyzers;
use crate::delivery::{Consumer, DeliveryChannel};
use crate::fusion::{
    CancelOutcome, FuseOutcome, FusionEngine, FusionError, FusionSettings, FusionStats, OpenOutcome,
    ResultSink, SubmitOutcome,
};
use crate::ingest::{self, ValidationError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqal_common::config::SqalConfig;
use sqal_common::events::{EventBus, SqalEvent};
use sqal_common::types::{FramePayload, FusionResult};
use sqal_common::{Modality, SampleId};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Acknowledgement returned for every accepted frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAck {
    pub sample_id: SampleId,
    pub modality: Modality,
    pub status: FrameStatus,
    /// Expected modalities not yet reported for this sample
    #[serde(default)]
    pub missing: Vec<Modality>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// Recorded; the sample is still collecting
    Waiting,
    /// This frame completed the sample
    Fused,
}

/// Pipeline-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub results_published: u64,
    pub results_dropped: u64,
    pub consumers: u64,
    pub fusion: FusionStats,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    results_published: AtomicU64,
    results_dropped: AtomicU64,
}

/// Fusion-side end of delivery: queues each result as it is fused
struct Publisher {
    delivery: Arc<DeliveryChannel>,
    counters: Arc<Counters>,
}

impl ResultSink for Publisher {
    fn publish(&self, result: &Arc<FusionResult>) {
        let report = self.delivery.publish(Arc::clone(result));
        self.counters.results_published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .results_dropped
            .fetch_add(report.overflowed as u64, Ordering::Relaxed);
        debug!(
            "Result {} delivered to {} consumers ({} removed)",
            result.sample_id, report.delivered, report.removed
        );
    }
}

/// Shared handle to the fusion pipeline (cheap to clone)
#[derive(Clone)]
pub struct Pipeline {
    analyzers: Arc<Analyzers>,
    engine: Arc<FusionEngine>,
    delivery: Arc<DeliveryChannel>,
    event_bus: EventBus,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        analyzers: Analyzers,
        settings: FusionSettings,
        delivery: DeliveryChannel,
        event_bus: EventBus,
    ) -> Self {
        let delivery = Arc::new(delivery);
        let counters = Arc::new(Counters::default());
        let publisher = Publisher {
            delivery: Arc::clone(&delivery),
            counters: Arc::clone(&counters),
        };

        Self {
            analyzers: Arc::new(analyzers),
            engine: Arc::new(FusionEngine::new(settings).with_sink(Arc::new(publisher))),
            delivery,
            event_bus,
            counters,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build every stage from the service configuration
    pub fn from_config(config: &SqalConfig, event_bus: EventBus) -> Self {
        Self::new(
            Analyzers::from_config(config),
            FusionSettings::from_config(&config.fusion),
            DeliveryChannel::new(config.delivery.queue_capacity),
            event_bus,
        )
    }

    pub fn engine(&self) -> &FusionEngine {
        &self.engine
    }

    pub fn delivery(&self) -> &DeliveryChannel {
        &self.delivery
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Decode and handle a JSON frame (WebSocket text message, recording line)
    pub fn handle_text(&self, text: &str) -> Result<FrameAck, ValidationError> {
        match ingest::parse_payload(text) {
            Ok(payload) => self.handle_frame(payload),
            Err(err) => {
                self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Frame rejected: {}", err);
                Err(err)
            }
        }
    }

    /// Validate, analyze and record one frame
    ///
    /// Must be called from within a Tokio runtime: opening a new sample
    /// spawns its wait task.
    pub fn handle_frame(&self, payload: FramePayload) -> Result<FrameAck, ValidationError> {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let modality = payload.modality();
        let sensor_id = payload.body().sensor_id.clone();
        let sample_id = payload.sample_id().clone();

        let frame = match ingest::ingest(payload, self.engine.as_ref()) {
            Ok(frame) => frame,
            Err(err) => return Err(self.reject(sensor_id, sample_id, modality, err)),
        };

        match self.engine.open(&sample_id) {
            OpenOutcome::Opened(token) => self.spawn_wait(sample_id.clone(), token),
            OpenOutcome::AlreadyWaiting => {}
            OpenOutcome::AlreadyFused => {
                let err = ValidationError::AlreadyFused(sample_id.clone());
                return Err(self.reject(sensor_id, sample_id, modality, err));
            }
        }

        let analysis = self.analyzers.analyze(frame);
        let recorded = SqalEvent::AnalysisRecorded {
            sample_id: sample_id.clone(),
            modality,
            sub_score: analysis.sub_score,
            confidence: analysis.confidence,
            unreliable: analysis.unreliable,
            timestamp: Utc::now(),
        };

        let ack = match self.engine.submit(analysis) {
            SubmitOutcome::Waiting { missing } => {
                self.event_bus.emit_lossy(recorded);
                FrameAck {
                    sample_id,
                    modality,
                    status: FrameStatus::Waiting,
                    missing,
                }
            }
            SubmitOutcome::Fused(result) => {
                self.event_bus.emit_lossy(recorded);
                self.announce(&result);
                FrameAck {
                    sample_id,
                    modality,
                    status: FrameStatus::Fused,
                    missing: Vec::new(),
                }
            }
            SubmitOutcome::Late(_) => {
                let err = ValidationError::AlreadyFused(sample_id.clone());
                return Err(self.reject(sensor_id, sample_id, modality, err));
            }
        };

        self.counters.frames_accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Frame accepted: {} {} ({:?})", ack.sample_id, modality, ack.status);
        Ok(ack)
    }

    /// Start the wait for a sample before any of its frames arrive
    ///
    /// Used when the line announces a product (e.g. a presence trigger); if
    /// no frame follows within the wait the sample is discarded.
    pub fn expect_sample(&self, sample_id: &SampleId) -> OpenOutcome {
        let outcome = self.engine.open(sample_id);
        match &outcome {
            OpenOutcome::Opened(token) => {
                info!("Sample {} announced; waiting for frames", sample_id);
                self.spawn_wait(sample_id.clone(), token.clone());
            }
            OpenOutcome::AlreadyWaiting => debug!("Sample {} already waiting", sample_id),
            OpenOutcome::AlreadyFused => debug!("Sample {} already fused", sample_id),
        }
        outcome
    }

    /// Fuse a sample now with whatever has arrived
    pub fn force_fuse(&self, sample_id: &SampleId) -> Result<Arc<FusionResult>, FusionError> {
        info!("Forced fusion requested for sample {}", sample_id);
        self.finish(sample_id)
    }

    /// Withdraw a waiting sample
    pub fn cancel(&self, sample_id: &SampleId) -> CancelOutcome {
        let outcome = self.engine.cancel(sample_id);
        if matches!(outcome, CancelOutcome::Cancelled) {
            self.event_bus.emit_lossy(SqalEvent::SampleCancelled {
                sample_id: sample_id.clone(),
                timestamp: Utc::now(),
            });
        }
        outcome
    }

    /// Register a live result consumer
    ///
    /// The consumer is unsubscribed when the returned handle is dropped.
    pub fn subscribe(&self, transport: &str) -> Subscription {
        let consumer = self.delivery.subscribe();
        info!("Result consumer {} connected via {}", consumer.id(), transport);
        self.event_bus.emit_lossy(SqalEvent::ConsumerConnected {
            consumer_id: consumer.id(),
            transport: transport.to_string(),
            timestamp: Utc::now(),
        });
        Subscription {
            pipeline: self.clone(),
            consumer,
        }
    }

    fn release(&self, consumer: &Consumer) {
        let dropped_count = consumer.dropped_count();
        self.delivery.unsubscribe(consumer);
        info!(
            "Result consumer {} disconnected ({} results dropped)",
            consumer.id(),
            dropped_count
        );
        self.event_bus.emit_lossy(SqalEvent::ConsumerDisconnected {
            consumer_id: consumer.id(),
            dropped_count,
            timestamp: Utc::now(),
        });
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_accepted: self.counters.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            results_published: self.counters.results_published.load(Ordering::Relaxed),
            results_dropped: self.counters.results_dropped.load(Ordering::Relaxed),
            consumers: self.delivery.consumer_count() as u64,
            fusion: self.engine.stats(),
        }
    }

    /// Stop every pending wait task; samples stay WAITING
    pub fn shutdown(&self) {
        info!("Pipeline shutting down");
        self.shutdown.cancel();
    }

    fn reject(
        &self,
        sensor_id: String,
        sample_id: SampleId,
        modality: Modality,
        err: ValidationError,
    ) -> ValidationError {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
        warn!("Frame from {} for sample {} rejected: {}", sensor_id, sample_id, err);
        self.event_bus.emit_lossy(SqalEvent::FrameRejected {
            sensor_id,
            sample_id,
            modality,
            reason: err.to_string(),
            timestamp: Utc::now(),
        });
        err
    }

    fn spawn_wait(&self, sample_id: SampleId, token: CancellationToken) {
        let pipeline = self.clone();
        let timeout = self.engine.settings().timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Wait for sample {} ended before timeout", sample_id);
                }
                _ = pipeline.shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!("Wait for sample {} expired after {:?}", sample_id, timeout);
                    // Outcome already surfaced through events and delivery
                    let _ = pipeline.finish(&sample_id);
                }
            }
        });
    }

    /// Fuse now; the engine delivers, this announces only if the call fused
    fn finish(&self, sample_id: &SampleId) -> Result<Arc<FusionResult>, FusionError> {
        match self.engine.fuse_now(sample_id) {
            Ok(FuseOutcome::Fused(result)) => {
                self.announce(&result);
                Ok(result)
            }
            Ok(FuseOutcome::Cached(result)) => Ok(result),
            Err(FusionError::NoData(id)) => {
                self.event_bus.emit_lossy(SqalEvent::SampleDiscarded {
                    sample_id: id.clone(),
                    timestamp: Utc::now(),
                });
                Err(FusionError::NoData(id))
            }
            Err(err) => {
                debug!("Fusion of {} skipped: {}", sample_id, err);
                Err(err)
            }
        }
    }

    fn announce(&self, result: &FusionResult) {
        self.event_bus.emit_lossy(SqalEvent::SampleFused {
            sample_id: result.sample_id.clone(),
            grade: result.final_grade,
            composite_score: result.composite_score,
            low_confidence: result.low_confidence,
            partial: !result.missing_modalities.is_empty(),
            timestamp: Utc::now(),
        });
    }
}

/// Live consumer registration tied to a connection's lifetime
pub struct Subscription {
    pipeline: Pipeline,
    consumer: Consumer,
}

impl Deref for Subscription {
    type Target = Consumer;

    fn deref(&self) -> &Consumer {
        &self.consumer
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pipeline.release(&self.consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_frames::*;
    use sqal_common::Grade;

    fn pipeline() -> Pipeline {
        Pipeline::from_config(&SqalConfig::default(), EventBus::new(64))
    }

    #[tokio::test]
    async fn test_complete_sample_fuses_and_delivers() {
        let pipeline = pipeline();
        let consumer = pipeline.subscribe("test");

        let ack = pipeline.handle_frame(depth_payload("S-1", 70.0, 30000.0)).unwrap();
        assert_eq!(ack.status, FrameStatus::Waiting);
        assert_eq!(ack.missing, vec![Modality::Spectral]);

        let ack = pipeline.handle_frame(spectral_payload("S-1", GOOD_SPECTRUM)).unwrap();
        assert_eq!(ack.status, FrameStatus::Fused);

        let result = consumer.try_recv().expect("result delivered");
        assert_eq!(result.sample_id, SampleId::from("S-1"));
        assert_eq!(result.final_grade, Grade::A);

        let stats = pipeline.stats();
        assert_eq!(stats.frames_accepted, 2);
        assert_eq!(stats.results_published, 1);
        assert_eq!(stats.fusion.fused, 1);
    }

    #[tokio::test]
    async fn test_rejected_frame_emits_event() {
        let pipeline = pipeline();
        let mut events = pipeline.event_bus().subscribe();

        let mut channels = GOOD_SPECTRUM;
        channels[0] = -5.0;
        let err = pipeline.handle_frame(spectral_payload("S-1", channels)).unwrap_err();
        assert!(matches!(err, ValidationError::IntensityOutOfBounds { .. }));

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type(), "FrameRejected");
        assert_eq!(pipeline.stats().frames_rejected, 1);
        assert!(pipeline.engine().pending().is_empty());
    }

    #[tokio::test]
    async fn test_frame_after_fusion_is_rejected() {
        let pipeline = pipeline();
        pipeline.handle_frame(depth_payload("S-1", 70.0, 30000.0)).unwrap();
        pipeline.handle_frame(spectral_payload("S-1", GOOD_SPECTRUM)).unwrap();

        let err = pipeline.handle_frame(spectral_payload("S-1", GOOD_SPECTRUM)).unwrap_err();
        assert_eq!(err, ValidationError::AlreadyFused(SampleId::from("S-1")));
    }

    #[tokio::test]
    async fn test_malformed_text_rejected() {
        let pipeline = pipeline();
        assert!(matches!(pipeline.handle_text("{"), Err(ValidationError::Malformed(_))));
        assert_eq!(pipeline.stats().frames_rejected, 1);
    }

    #[tokio::test]
    async fn test_force_fuse_and_cancel() {
        let pipeline = pipeline();
        pipeline.handle_frame(spectral_payload("S-1", GOOD_SPECTRUM)).unwrap();
        let result = pipeline.force_fuse(&SampleId::from("S-1")).unwrap();
        assert_eq!(result.missing_modalities, vec![Modality::DepthArray]);

        pipeline.handle_frame(spectral_payload("S-2", GOOD_SPECTRUM)).unwrap();
        assert!(matches!(pipeline.cancel(&SampleId::from("S-2")), CancelOutcome::Cancelled));
        assert_eq!(
            pipeline.force_fuse(&SampleId::from("S-2")).unwrap_err(),
            FusionError::Cancelled(SampleId::from("S-2"))
        );
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let pipeline = pipeline();
        let mut events = pipeline.event_bus().subscribe();

        let subscription = pipeline.subscribe("test");
        assert_eq!(pipeline.stats().consumers, 1);
        drop(subscription);

        assert_eq!(pipeline.stats().consumers, 0);
        assert_eq!(events.try_recv().unwrap().event_type(), "ConsumerConnected");
        assert_eq!(events.try_recv().unwrap().event_type(), "ConsumerDisconnected");
    }
}
