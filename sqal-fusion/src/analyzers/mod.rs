//! Per-modality analyzers
//!
//! Each analyzer turns one validated [`RawFrame`] into a [`ModalityAnalysis`]:
//! named derived indices, a [0,1] sub-score and a [0,1] confidence.
//! Analyzers are pure given their calibration and never wait on one another,
//! so frames of different modalities can be analyzed concurrently.

pub mod depth;
pub mod spectral;

pub use depth::DepthAnalyzer;
pub use spectral::SpectralAnalyzer;

use crate::ingest::RawFrame;
use sqal_common::config::SqalConfig;
use sqal_common::types::ModalityAnalysis;
use sqal_common::Modality;

/// Contract shared by every modality analyzer
pub trait ModalityAnalyzer: Send + Sync {
    /// Modality this analyzer understands
    fn modality(&self) -> Modality;

    /// Compute indices, sub-score and confidence for one frame
    fn analyze(&self, frame: RawFrame) -> ModalityAnalysis;
}

/// The analyzer set used by the pipeline, dispatching on frame modality
#[derive(Debug, Clone)]
pub struct Analyzers {
    depth: DepthAnalyzer,
    spectral: SpectralAnalyzer,
}

impl Analyzers {
    pub fn new(depth: DepthAnalyzer, spectral: SpectralAnalyzer) -> Self {
        Self { depth, spectral }
    }

    pub fn from_config(config: &SqalConfig) -> Self {
        Self::new(
            DepthAnalyzer::new(config.depth.clone()),
            SpectralAnalyzer::new(config.spectral.clone()),
        )
    }

    pub fn analyze(&self, frame: RawFrame) -> ModalityAnalysis {
        match frame.modality() {
            Modality::DepthArray => self.depth.analyze(frame),
            Modality::Spectral => self.spectral.analyze(frame),
        }
    }
}

/// Population mean and variance; (0, 0) for an empty slice
pub(crate) fn mean_variance(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::test_frames::*;

    #[test]
    fn test_mean_variance() {
        let (mean, variance) = mean_variance(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(variance, 4.0);
        assert_eq!(mean_variance(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_dispatch_by_modality() {
        let analyzers = Analyzers::from_config(&SqalConfig::default());

        let depth = analyzers.analyze(depth_frame("S-1", 70.0, 30000.0));
        assert_eq!(depth.modality, Modality::DepthArray);
        assert!(depth.derived_indices.contains_key("thickness_mm"));

        let spectral = analyzers.analyze(spectral_frame("S-1", GOOD_SPECTRUM));
        assert_eq!(spectral.modality, Modality::Spectral);
        assert!(spectral.derived_indices.contains_key("oxidation_ratio"));
    }
}
