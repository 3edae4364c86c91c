//! Raw reading ingestion
//!
//! Validates inbound frame payloads and turns them into immutable [`RawFrame`]s.
//! This is the only place the wire schema is checked; analyzers and fusion
//! consume the typed form and never re-validate.
//!
//! **Checks, in order:**
//! - identifiers present
//! - value count matches the modality tag
//! - every value finite and within the sensor's physical range
//! - sample not already fused (replay protection)

use chrono::{DateTime, Utc};
use sqal_common::types::{FramePayload, DEPTH_MAX_RANGE_MM, SENSOR_FULL_SCALE};
use sqal_common::{Modality, SampleId};
use std::collections::HashSet;
use thiserror::Error;

/// Reasons a frame is refused at the ingestion boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed frame payload: {0}")]
    Malformed(String),

    #[error("sensor_id must not be empty")]
    MissingSensorId,

    #[error("sample_id must not be empty")]
    MissingSampleId,

    #[error("{modality} frame carries {actual} values, expected {expected}")]
    ChannelCount {
        modality: Modality,
        expected: usize,
        actual: usize,
    },

    #[error("{modality} value #{index} is not a finite number")]
    NonFinite { modality: Modality, index: usize },

    #[error("range {value} mm in zone {zone} is outside [0, {max}] mm")]
    RangeOutOfBounds { zone: usize, value: f64, max: f64 },

    #[error("{channel} intensity {value} is outside the sensor's 16-bit range")]
    IntensityOutOfBounds { channel: String, value: f64 },

    #[error("sample {0} has already been fused")]
    AlreadyFused(SampleId),
}

/// Lookup of samples that have completed fusion
pub trait FusedSamples {
    fn is_fused(&self, sample_id: &SampleId) -> bool;
}

impl FusedSamples for HashSet<SampleId> {
    fn is_fused(&self, sample_id: &SampleId) -> bool {
        self.contains(sample_id)
    }
}

/// One validated sensor acquisition
///
/// Immutable once created; consumed by value by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    sensor_id: String,
    modality: Modality,
    timestamp: DateTime<Utc>,
    sample_id: SampleId,
    raw_values: Vec<f64>,
}

impl RawFrame {
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sample_id(&self) -> &SampleId {
        &self.sample_id
    }

    pub fn raw_values(&self) -> &[f64] {
        &self.raw_values
    }

    /// Range readings of a depth frame (even positions)
    pub fn ranges(&self) -> impl Iterator<Item = f64> + '_ {
        self.raw_values.iter().step_by(2).copied()
    }

    /// Signal-strength readings of a depth frame (odd positions)
    pub fn signals(&self) -> impl Iterator<Item = f64> + '_ {
        self.raw_values.iter().skip(1).step_by(2).copied()
    }
}

/// Decode a JSON frame payload received as text
pub fn parse_payload(text: &str) -> Result<FramePayload, ValidationError> {
    serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Validate a payload and produce the immutable frame
pub fn ingest<F>(payload: FramePayload, fused: &F) -> Result<RawFrame, ValidationError>
where
    F: FusedSamples + ?Sized,
{
    let modality = payload.modality();
    let body = payload.into_body();

    if body.sensor_id.trim().is_empty() {
        return Err(ValidationError::MissingSensorId);
    }
    if body.sample_id.is_blank() {
        return Err(ValidationError::MissingSampleId);
    }

    let expected = modality.expected_value_count();
    if body.raw_values.len() != expected {
        return Err(ValidationError::ChannelCount {
            modality,
            expected,
            actual: body.raw_values.len(),
        });
    }

    if let Some(index) = body.raw_values.iter().position(|v| !v.is_finite()) {
        return Err(ValidationError::NonFinite { modality, index });
    }

    match modality {
        Modality::DepthArray => check_depth_values(&body.raw_values)?,
        Modality::Spectral => check_spectral_values(&body.raw_values)?,
    }

    if fused.is_fused(&body.sample_id) {
        return Err(ValidationError::AlreadyFused(body.sample_id));
    }

    Ok(RawFrame {
        sensor_id: body.sensor_id,
        modality,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        sample_id: body.sample_id,
        raw_values: body.raw_values,
    })
}

fn check_depth_values(values: &[f64]) -> Result<(), ValidationError> {
    for (zone, pair) in values.chunks_exact(2).enumerate() {
        let (range, signal) = (pair[0], pair[1]);
        if !(0.0..=DEPTH_MAX_RANGE_MM).contains(&range) {
            return Err(ValidationError::RangeOutOfBounds {
                zone,
                value: range,
                max: DEPTH_MAX_RANGE_MM,
            });
        }
        if !(0.0..=SENSOR_FULL_SCALE).contains(&signal) {
            return Err(ValidationError::IntensityOutOfBounds {
                channel: format!("zone {} signal", zone),
                value: signal,
            });
        }
    }
    Ok(())
}

fn check_spectral_values(values: &[f64]) -> Result<(), ValidationError> {
    for (index, &value) in values.iter().enumerate() {
        if !(0.0..=SENSOR_FULL_SCALE).contains(&value) {
            return Err(ValidationError::IntensityOutOfBounds {
                channel: format!("F{}", index + 1),
                value,
            });
        }
    }
    Ok(())
}
