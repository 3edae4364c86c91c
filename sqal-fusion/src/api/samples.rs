//! Sample operations
//!
//! Announce, inspect, force-fuse and cancel samples by `sample_id`.

use crate::error::{ApiError, ApiResult};
use crate::fusion::{CancelOutcome, OpenOutcome, PendingSummary, SampleStatus};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqal_common::types::FusionResult;
use sqal_common::SampleId;
use std::sync::Arc;

/// GET /api/samples response
#[derive(Debug, Serialize)]
pub struct PendingSamplesResponse {
    pub count: usize,
    pub samples: Vec<PendingSummary>,
}

/// DELETE /api/samples/:sample_id response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub sample_id: SampleId,
    pub state: &'static str,
    /// Present when the sample had already been fused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<FusionResult>>,
}

/// PUT /api/samples/:sample_id response
#[derive(Debug, Serialize)]
pub struct ExpectResponse {
    pub sample_id: SampleId,
    pub state: &'static str,
}

/// Path ids must name something
fn sample_path(raw: String) -> ApiResult<SampleId> {
    if raw.trim().is_empty() {
        return Err(ApiError::BadRequest("sample_id must not be empty".to_string()));
    }
    Ok(SampleId::new(raw))
}

/// GET /api/samples
pub async fn list_pending(State(state): State<AppState>) -> Json<PendingSamplesResponse> {
    let samples = state.pipeline.engine().pending();
    Json(PendingSamplesResponse {
        count: samples.len(),
        samples,
    })
}

/// GET /api/samples/:sample_id
pub async fn get_sample(
    State(state): State<AppState>,
    Path(sample_id): Path<String>,
) -> ApiResult<Json<SampleStatus>> {
    let sample_id = sample_path(sample_id)?;
    state
        .pipeline
        .engine()
        .state(&sample_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("sample {}", sample_id)))
}

/// POST /api/samples/:sample_id/fuse
///
/// Fuses a waiting sample now with whatever has arrived; returns the cached
/// result for a sample that is already fused.
pub async fn fuse_sample(
    State(state): State<AppState>,
    Path(sample_id): Path<String>,
) -> ApiResult<Json<Arc<FusionResult>>> {
    let result = state.pipeline.force_fuse(&sample_path(sample_id)?)?;
    Ok(Json(result))
}

/// PUT /api/samples/:sample_id
///
/// Opens the sample's wait ahead of its frames: 201 when opened, 200 when it
/// was already waiting, 409 once fused.
pub async fn expect_sample(
    State(state): State<AppState>,
    Path(sample_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ExpectResponse>)> {
    let sample_id = sample_path(sample_id)?;
    let status = match state.pipeline.expect_sample(&sample_id) {
        OpenOutcome::Opened(_) => StatusCode::CREATED,
        OpenOutcome::AlreadyWaiting => StatusCode::OK,
        OpenOutcome::AlreadyFused => {
            return Err(ApiError::Conflict(format!("sample {} has already been fused", sample_id)))
        }
    };

    Ok((
        status,
        Json(ExpectResponse {
            sample_id,
            state: "waiting",
        }),
    ))
}

/// DELETE /api/samples/:sample_id
pub async fn cancel_sample(
    State(state): State<AppState>,
    Path(sample_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let sample_id = sample_path(sample_id)?;
    let (state_name, result) = match state.pipeline.cancel(&sample_id) {
        CancelOutcome::Cancelled => ("cancelled", None),
        CancelOutcome::AlreadyFused(result) => ("fused", Some(result)),
        CancelOutcome::AlreadyClosed => {
            return Err(ApiError::Conflict(format!("sample {} is no longer waiting", sample_id)))
        }
        CancelOutcome::NotFound => return Err(ApiError::NotFound(format!("sample {}", sample_id))),
    };

    Ok(Json(CancelResponse {
        sample_id,
        state: state_name,
        result,
    }))
}

/// Build sample operation routes
pub fn sample_routes() -> Router<AppState> {
    Router::new()
        .route("/api/samples", get(list_pending))
        .route(
            "/api/samples/:sample_id",
            get(get_sample).put(expect_sample).delete(cancel_sample),
        )
        .route("/api/samples/:sample_id/fuse", post(fuse_sample))
}
