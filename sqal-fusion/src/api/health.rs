//! Health and statistics endpoints

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::pipeline::PipelineStats;
use crate::AppState;

/// Build identification captured by `build.rs`
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub build_profile: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("SQAL_GIT_HASH"),
            build_timestamp: env!("SQAL_BUILD_TIMESTAMP"),
            build_profile: env!("SQAL_BUILD_PROFILE"),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" while the pipeline accepts frames
    pub status: &'static str,
    pub module: &'static str,
    pub build: BuildInfo,
    pub uptime_seconds: u64,
    pub pending_samples: u64,
    pub consumers: u64,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let stats = state.pipeline.stats();

    Json(HealthResponse {
        status: if state.shutdown.is_cancelled() { "shutting_down" } else { "ok" },
        module: "sqal-fusion",
        build: BuildInfo::current(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        pending_samples: stats.fusion.pending,
        consumers: stats.consumers,
    })
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.pipeline.stats())
}

/// Build health and statistics routes
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
}
