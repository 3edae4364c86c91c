//! sqal-fusion library interface
//!
//! Multi-sensor quality control core: validated depth-array and spectral
//! frames are analyzed per modality, joined on `sample_id`, fused into a
//! graded result and pushed to live consumers.
//!
//! Exposes the pipeline and router for the binaries and integration tests.

pub mod analyzers;
pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fusion;
pub mod ingest;
pub mod pipeline;
pub mod simulator;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};
pub use crate::pipeline::Pipeline;

use axum::Router;
use chrono::{DateTime, Utc};
use sqal_common::config::SqalConfig;
use sqal_common::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Service events for `/events`
    pub event_bus: EventBus,
    pub config: Arc<SqalConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Cancelled on shutdown; long-lived connections watch it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: SqalConfig) -> Self {
        let event_bus = EventBus::new(config.delivery.event_bus_capacity);
        let pipeline = Pipeline::from_config(&config, event_bus.clone());
        Self {
            pipeline,
            event_bus,
            config: Arc::new(config),
            startup_time: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.delivery.heartbeat_secs)
    }

    /// Stop streaming connections and pending waits
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pipeline.shutdown();
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::frame_routes())
        .merge(api::result_routes())
        .merge(api::sample_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
