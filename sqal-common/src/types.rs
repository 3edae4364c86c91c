//! Shared data contracts for the SQAL inspection pipeline
//!
//! These types cross the boundaries between ingestion, per-modality analysis,
//! fusion and live delivery, and between the server and the simulator.
//!
//! **Channel layouts:**
//! - Depth array: 8x8 zones, interleaved `[range_0, signal_0, range_1, signal_1, ...]`
//! - Spectral: 8 channels F1..F8 (415, 445, 480, 515, 555, 590, 630, 680 nm)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Zones per side of the time-of-flight matrix
pub const DEPTH_GRID_SIDE: usize = 8;

/// Number of zones in the time-of-flight matrix
pub const DEPTH_ZONES: usize = DEPTH_GRID_SIDE * DEPTH_GRID_SIDE;

/// Values per depth frame (range + signal strength per zone)
pub const DEPTH_VALUE_COUNT: usize = DEPTH_ZONES * 2;

/// Maximum measurable range of the time-of-flight sensor (mm)
pub const DEPTH_MAX_RANGE_MM: f64 = 4000.0;

/// Number of spectral channels
pub const SPECTRAL_CHANNELS: usize = 8;

/// Full-scale reading of both sensors' 16-bit ADCs
pub const SENSOR_FULL_SCALE: f64 = 65535.0;

/// Sensor technology that produced a frame
///
/// Variant order is the canonical combination order used by fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Time-of-flight depth array
    DepthArray,
    /// Multi-channel spectral sensor
    Spectral,
}

impl Modality {
    /// Every modality, in canonical order
    pub const ALL: [Modality; 2] = [Modality::DepthArray, Modality::Spectral];

    /// Number of raw values a frame of this modality must carry
    pub fn expected_value_count(self) -> usize {
        match self {
            Modality::DepthArray => DEPTH_VALUE_COUNT,
            Modality::Spectral => SPECTRAL_CHANNELS,
        }
    }

    /// Wire name (matches the serde representation)
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::DepthArray => "depth_array",
            Modality::Spectral => "spectral",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one physical inspection event, shared by all modality frames
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(String);

impl SampleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SampleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SampleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Free-form frame metadata (firmware version, belt speed, operator notes...)
pub type FrameMetadata = HashMap<String, serde_json::Value>;

/// Fields common to every inbound frame payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameBody {
    pub sensor_id: String,
    pub sample_id: SampleId,
    /// Acquisition time; ingestion stamps the arrival time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub raw_values: Vec<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: FrameMetadata,
}

/// Inbound frame as it arrives on the wire
///
/// The `modality` tag selects the expected shape of `raw_values`.
///
/// ```
/// use sqal_common::types::FramePayload;
///
/// let json = r#"{"modality":"spectral","sensor_id":"as7341-01","sample_id":"S-1",
///               "raw_values":[1,2,3,4,5,6,7,8]}"#;
/// let payload: FramePayload = serde_json::from_str(json).unwrap();
/// assert_eq!(payload.modality(), sqal_common::Modality::Spectral);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modality", rename_all = "snake_case")]
pub enum FramePayload {
    DepthArray(FrameBody),
    Spectral(FrameBody),
}

impl FramePayload {
    pub fn modality(&self) -> Modality {
        match self {
            FramePayload::DepthArray(_) => Modality::DepthArray,
            FramePayload::Spectral(_) => Modality::Spectral,
        }
    }

    pub fn body(&self) -> &FrameBody {
        match self {
            FramePayload::DepthArray(body) | FramePayload::Spectral(body) => body,
        }
    }

    pub fn into_body(self) -> FrameBody {
        match self {
            FramePayload::DepthArray(body) | FramePayload::Spectral(body) => body,
        }
    }

    pub fn sample_id(&self) -> &SampleId {
        &self.body().sample_id
    }
}

/// Derived result for one modality of one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityAnalysis {
    pub sample_id: SampleId,
    pub sensor_id: String,
    pub modality: Modality,
    /// Named derived indices (ratios, thickness, uniformity...)
    pub derived_indices: BTreeMap<String, f64>,
    /// Normalized quality estimate, always within [0, 1]
    pub sub_score: f64,
    /// Signal-quality confidence, always within [0, 1]
    pub confidence: f64,
    /// Set for all-zero or all-saturated readings
    pub unreliable: bool,
    pub analyzed_at: DateTime<Utc>,
}

impl ModalityAnalysis {
    /// Build an analysis, clamping score and confidence into [0, 1]
    pub fn new(
        sample_id: SampleId,
        sensor_id: impl Into<String>,
        modality: Modality,
        derived_indices: BTreeMap<String, f64>,
        sub_score: f64,
        confidence: f64,
    ) -> Self {
        Self {
            sample_id,
            sensor_id: sensor_id.into(),
            modality,
            derived_indices,
            sub_score: unit_interval(sub_score),
            confidence: unit_interval(confidence),
            unreliable: false,
            analyzed_at: Utc::now(),
        }
    }

    /// Analysis for a reading that carries no usable signal
    pub fn unreliable(
        sample_id: SampleId,
        sensor_id: impl Into<String>,
        modality: Modality,
        derived_indices: BTreeMap<String, f64>,
    ) -> Self {
        let mut analysis = Self::new(sample_id, sensor_id, modality, derived_indices, 0.0, 0.0);
        analysis.unreliable = true;
        analysis
    }
}

/// Clamp into [0, 1]; NaN maps to 0
pub fn unit_interval(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Final quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    #[serde(rename = "REJECT")]
    Reject,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::A => write!(f, "A"),
            Grade::B => write!(f, "B"),
            Grade::C => write!(f, "C"),
            Grade::Reject => write!(f, "REJECT"),
        }
    }
}

/// Final fused grade for one sample
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    pub sample_id: SampleId,
    pub final_grade: Grade,
    /// Confidence-weighted average of the contributing sub-scores
    pub composite_score: f64,
    /// Analyses used, in canonical modality order
    pub contributing_analyses: Vec<ModalityAnalysis>,
    /// Expected modalities that never reported before the wait expired
    pub missing_modalities: Vec<Modality>,
    /// Largest pairwise sub-score gap between contributing modalities
    pub disagreement: f64,
    /// Manual review required
    pub low_confidence: bool,
    pub fused_at: DateTime<Utc>,
}

impl FusionResult {
    /// Sub-score reported by a modality, if it contributed
    pub fn sub_score(&self, modality: Modality) -> Option<f64> {
        self.contributing_analyses
            .iter()
            .find(|a| a.modality == modality)
            .map(|a| a.sub_score)
    }
}

/// Per-modality score line of an outbound result message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityScore {
    pub modality: Modality,
    pub sub_score: f64,
    pub confidence: f64,
    pub unreliable: bool,
}

/// Outbound message pushed to live consumers for each fused sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub sample_id: SampleId,
    pub final_grade: Grade,
    pub composite_score: f64,
    pub sub_scores: Vec<ModalityScore>,
    pub low_confidence: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_modalities: Vec<Modality>,
    pub fused_at: DateTime<Utc>,
}

impl From<&FusionResult> for ResultMessage {
    fn from(result: &FusionResult) -> Self {
        Self {
            sample_id: result.sample_id.clone(),
            final_grade: result.final_grade,
            composite_score: result.composite_score,
            sub_scores: result
                .contributing_analyses
                .iter()
                .map(|a| ModalityScore {
                    modality: a.modality,
                    sub_score: a.sub_score,
                    confidence: a.confidence,
                    unreliable: a.unreliable,
                })
                .collect(),
            low_confidence: result.low_confidence,
            missing_modalities: result.missing_modalities.clone(),
            fused_at: result.fused_at,
        }
    }
}
