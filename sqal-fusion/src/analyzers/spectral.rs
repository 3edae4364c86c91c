//! Eight-channel spectral analyzer
//!
//! Tissue quality bands are told apart by ratios between designated channel
//! pairs. Each configured ratio scores 1 inside its calibrated ideal band and
//! decays linearly to 0 at `tolerance` outside it; the sub-score is the mean
//! ratio score.
//!
//! Confidence follows the total signal magnitude: readings near the noise
//! floor or near saturation are trusted less. Each individually saturated
//! channel costs a further 1/8 of the confidence.

use super::ModalityAnalyzer;
use crate::ingest::RawFrame;
use sqal_common::config::{RatioBand, SpectralCalibration};
use sqal_common::types::{ModalityAnalysis, SENSOR_FULL_SCALE, SPECTRAL_CHANNELS};
use sqal_common::Modality;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SpectralAnalyzer {
    calibration: SpectralCalibration,
}

impl SpectralAnalyzer {
    pub fn new(calibration: SpectralCalibration) -> Self {
        Self { calibration }
    }

    /// Confidence contributed by the mean channel magnitude (fraction of full scale)
    fn magnitude_confidence(&self, magnitude: f64) -> f64 {
        let c = &self.calibration;
        if magnitude <= c.floor_fraction || magnitude >= c.saturation_fraction {
            0.0
        } else if magnitude < c.healthy_low {
            (magnitude - c.floor_fraction) / (c.healthy_low - c.floor_fraction)
        } else if magnitude <= c.healthy_high {
            1.0
        } else {
            (c.saturation_fraction - magnitude) / (c.saturation_fraction - c.healthy_high)
        }
    }
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new(SpectralCalibration::default())
    }
}

/// Reading of a 1-based channel, if the frame has it
fn channel(channels: &[f64], number: usize) -> Option<f64> {
    channels.get(number.checked_sub(1)?).copied()
}

/// Ratio of two 1-based channels
///
/// 0 when the denominator reads 0 or the band names a channel the frame
/// does not have.
fn channel_ratio(channels: &[f64], band: &RatioBand) -> f64 {
    match (channel(channels, band.numerator), channel(channels, band.denominator)) {
        (Some(numerator), Some(denominator)) if denominator > 0.0 => numerator / denominator,
        _ => 0.0,
    }
}

/// 1 inside the ideal band, linear fall-off to 0 at `tolerance` outside
fn band_score(ratio: f64, band: &RatioBand) -> f64 {
    let distance = if ratio < band.ideal_min {
        band.ideal_min - ratio
    } else if ratio > band.ideal_max {
        ratio - band.ideal_max
    } else {
        0.0
    };
    (1.0 - distance / band.tolerance).max(0.0)
}

impl ModalityAnalyzer for SpectralAnalyzer {
    fn modality(&self) -> Modality {
        Modality::Spectral
    }

    fn analyze(&self, frame: RawFrame) -> ModalityAnalysis {
        debug_assert_eq!(frame.modality(), Modality::Spectral);

        let channels = frame.raw_values();
        let saturated = channels.iter().filter(|&&v| v >= SENSOR_FULL_SCALE).count();
        let all_zero = channels.iter().all(|&v| v == 0.0);

        if all_zero || saturated == SPECTRAL_CHANNELS {
            warn!(
                "Spectral frame from {} for sample {} is {}; flagged unreliable",
                frame.sensor_id(),
                frame.sample_id(),
                if all_zero { "all zero" } else { "saturated" }
            );
            let mut indices = BTreeMap::new();
            indices.insert("mean_intensity".to_string(), if all_zero { 0.0 } else { 1.0 });
            return ModalityAnalysis::unreliable(
                frame.sample_id().clone(),
                frame.sensor_id(),
                Modality::Spectral,
                indices,
            );
        }

        let mut indices = BTreeMap::new();
        let mut score_sum = 0.0;
        for band in &self.calibration.ratios {
            let ratio = channel_ratio(channels, band);
            let score = band_score(ratio, band);
            score_sum += score;
            indices.insert(band.name.clone(), ratio);
            indices.insert(format!("{}_score", band.name), score);
        }
        let sub_score = if self.calibration.ratios.is_empty() {
            0.0
        } else {
            score_sum / self.calibration.ratios.len() as f64
        };

        let magnitude =
            channels.iter().sum::<f64>() / (SPECTRAL_CHANNELS as f64 * SENSOR_FULL_SCALE);
        let saturation_penalty = 1.0 - saturated as f64 / SPECTRAL_CHANNELS as f64;
        let confidence = self.magnitude_confidence(magnitude) * saturation_penalty;

        indices.insert("mean_intensity".to_string(), magnitude);
        indices.insert("saturated_channels".to_string(), saturated as f64);

        debug!(
            "Spectral analysis {}: sub-score {:.3}, magnitude {:.3}, confidence {:.3}",
            frame.sample_id(),
            sub_score,
            magnitude,
            confidence
        );

        ModalityAnalysis::new(
            frame.sample_id().clone(),
            frame.sensor_id(),
            Modality::Spectral,
            indices,
            sub_score,
            confidence,
        )
    }
}
