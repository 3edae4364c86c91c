//! Time-of-flight depth-array analyzer
//!
//! Reads the 8x8 range matrix against the conveyor reference plane:
//! - thickness: how far the product surface sits above the belt on average
//! - volume: per-zone height above the belt times the zone footprint
//! - surface uniformity: 1 at a flat surface, 0 once the range spread reaches
//!   the calibrated tolerance
//!
//! The sub-score is a weighted sum of uniformity and thickness score, so it
//! is monotonic in both. Confidence falls as the normalized signal-strength
//! variance grows: `1 / (1 + variance / noise_reference)`.

use super::{mean_variance, ModalityAnalyzer};
use crate::ingest::RawFrame;
use sqal_common::config::DepthCalibration;
use sqal_common::types::{ModalityAnalysis, SENSOR_FULL_SCALE};
use sqal_common::Modality;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DepthAnalyzer {
    calibration: DepthCalibration,
}

impl DepthAnalyzer {
    pub fn new(calibration: DepthCalibration) -> Self {
        Self { calibration }
    }
}

impl Default for DepthAnalyzer {
    fn default() -> Self {
        Self::new(DepthCalibration::default())
    }
}

impl ModalityAnalyzer for DepthAnalyzer {
    fn modality(&self) -> Modality {
        Modality::DepthArray
    }

    fn analyze(&self, frame: RawFrame) -> ModalityAnalysis {
        debug_assert_eq!(frame.modality(), Modality::DepthArray);

        let c = &self.calibration;
        let ranges: Vec<f64> = frame.ranges().collect();
        let signals: Vec<f64> = frame.signals().map(|s| s / SENSOR_FULL_SCALE).collect();

        let all_zero = frame.raw_values().iter().all(|&v| v == 0.0);
        let all_saturated = signals.iter().all(|&s| s >= 1.0);
        if all_zero || all_saturated {
            warn!(
                "Depth frame from {} for sample {} is {}; flagged unreliable",
                frame.sensor_id(),
                frame.sample_id(),
                if all_zero { "all zero" } else { "saturated" }
            );
            let mut indices = BTreeMap::new();
            indices.insert("signal_mean".to_string(), if all_zero { 0.0 } else { 1.0 });
            return ModalityAnalysis::unreliable(
                frame.sample_id().clone(),
                frame.sensor_id(),
                Modality::DepthArray,
                indices,
            );
        }

        let (mean_range, range_variance) = mean_variance(&ranges);
        let range_std = range_variance.sqrt();

        let thickness_mm = (c.reference_distance_mm - mean_range).max(0.0);
        let volume_mm3: f64 = ranges
            .iter()
            .map(|r| (c.reference_distance_mm - r).max(0.0) * c.zone_area_mm2)
            .sum();

        let surface_uniformity = 1.0 - (range_std / c.uniformity_tolerance_mm).min(1.0);
        let thickness_score = (thickness_mm / c.target_thickness_mm).clamp(0.0, 1.0);
        let sub_score =
            c.uniformity_weight * surface_uniformity + c.thickness_weight * thickness_score;

        let (signal_mean, signal_variance) = mean_variance(&signals);
        let confidence = 1.0 / (1.0 + signal_variance / c.noise_reference);

        let mut indices = BTreeMap::new();
        indices.insert("mean_range_mm".to_string(), mean_range);
        indices.insert("range_std_mm".to_string(), range_std);
        indices.insert("thickness_mm".to_string(), thickness_mm);
        indices.insert("volume_mm3".to_string(), volume_mm3);
        indices.insert("surface_uniformity".to_string(), surface_uniformity);
        indices.insert("thickness_score".to_string(), thickness_score);
        indices.insert("signal_mean".to_string(), signal_mean);
        indices.insert("signal_variance".to_string(), signal_variance);

        debug!(
            "Depth analysis {}: thickness {:.1} mm, uniformity {:.3}, \
             sub-score {:.3}, confidence {:.3}",
            frame.sample_id(),
            thickness_mm,
            surface_uniformity,
            sub_score,
            confidence
        );

        ModalityAnalysis::new(
            frame.sample_id().clone(),
            frame.sensor_id(),
            Modality::DepthArray,
            indices,
            sub_score,
            confidence,
        )
    }
}
