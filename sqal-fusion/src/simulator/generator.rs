//! Synthetic frame generator
//!
//! Produces a depth-array frame and a spectral frame per sample, shaped after
//! a target quality profile with random jitter. Seeded generators are
//! reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sqal_common::types::{
    FrameBody, FrameMetadata, FramePayload, DEPTH_MAX_RANGE_MM, DEPTH_ZONES, SENSOR_FULL_SCALE,
    SPECTRAL_CHANNELS,
};
use sqal_common::SampleId;
use std::fmt;

/// Quality the synthetic product should present to the sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Target thickness, flat surface, every spectral ratio in band
    Good,
    /// Thin-ish product with some roughness, oxidation ratio low
    Fair,
    /// Thin rough product, ratios far out of band
    Poor,
    /// Good product seen through unstable, dim sensors
    Noisy,
    /// Every reading pinned at full scale
    Saturated,
}

impl QualityProfile {
    pub const ALL: [QualityProfile; 5] = [
        QualityProfile::Good,
        QualityProfile::Fair,
        QualityProfile::Poor,
        QualityProfile::Noisy,
        QualityProfile::Saturated,
    ];

    /// (mean range mm, range jitter mm)
    fn geometry(self) -> (f64, f64) {
        match self {
            QualityProfile::Good | QualityProfile::Noisy => (70.0, 1.0),
            QualityProfile::Fair => (85.0, 4.0),
            QualityProfile::Poor => (105.0, 9.0),
            QualityProfile::Saturated => (70.0, 0.0),
        }
    }

    /// F1..F8 before jitter
    fn spectrum(self) -> [f64; SPECTRAL_CHANNELS] {
        match self {
            QualityProfile::Good => [
                9000.0, 12000.0, 15000.0, 20000.0, 26000.0, 28000.0, 24000.0, 18000.0,
            ],
            QualityProfile::Fair => [
                9000.0, 12000.0, 9600.0, 20000.0, 26000.0, 28000.0, 24000.0, 18000.0,
            ],
            QualityProfile::Poor => [
                9000.0, 12000.0, 30000.0, 20000.0, 10000.0, 14000.0, 24000.0, 18000.0,
            ],
            QualityProfile::Noisy => {
                [900.0, 1200.0, 1500.0, 2000.0, 2600.0, 2800.0, 2400.0, 1800.0]
            }
            QualityProfile::Saturated => [SENSOR_FULL_SCALE; SPECTRAL_CHANNELS],
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityProfile::Good => "good",
            QualityProfile::Fair => "fair",
            QualityProfile::Poor => "poor",
            QualityProfile::Noisy => "noisy",
            QualityProfile::Saturated => "saturated",
        };
        f.write_str(name)
    }
}

/// Relative jitter applied to spectral channels
const SPECTRAL_JITTER: f64 = 0.02;

pub struct FrameGenerator {
    rng: StdRng,
    profile: QualityProfile,
    prefix: String,
    next_sample: u64,
}

impl FrameGenerator {
    pub fn new(profile: QualityProfile) -> Self {
        Self::with_rng(profile, StdRng::from_entropy())
    }

    pub fn seeded(profile: QualityProfile, seed: u64) -> Self {
        Self::with_rng(profile, StdRng::seed_from_u64(seed))
    }

    fn with_rng(profile: QualityProfile, rng: StdRng) -> Self {
        Self {
            rng,
            profile,
            prefix: "SIM".to_string(),
            next_sample: 1,
        }
    }

    /// Prefix for generated sample ids (`<prefix>-000001`)
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Depth and spectral frames for the next sample
    pub fn next_sample(&mut self) -> [FramePayload; 2] {
        let sample_id = SampleId::new(format!("{}-{:06}", self.prefix, self.next_sample));
        self.next_sample += 1;
        [self.depth_frame(&sample_id), self.spectral_frame(&sample_id)]
    }

    /// Frames for `count` samples, depth then spectral per sample
    pub fn samples(&mut self, count: usize) -> Vec<FramePayload> {
        (0..count).flat_map(|_| self.next_sample()).collect()
    }

    fn depth_frame(&mut self, sample_id: &SampleId) -> FramePayload {
        let (mean_range, jitter) = self.profile.geometry();
        let mut values = Vec::with_capacity(DEPTH_ZONES * 2);

        for zone in 0..DEPTH_ZONES {
            let range = if jitter > 0.0 {
                mean_range + self.rng.gen_range(-jitter..=jitter)
            } else {
                mean_range
            };
            let signal = match self.profile {
                QualityProfile::Saturated => SENSOR_FULL_SCALE,
                QualityProfile::Noisy => {
                    // Strong zone-to-zone swings in return strength
                    if zone % 2 == 0 {
                        self.rng.gen_range(2000.0..6000.0)
                    } else {
                        self.rng.gen_range(55000.0..63000.0)
                    }
                }
                _ => 30000.0 + self.rng.gen_range(-500.0..=500.0),
            };
            values.push(range.clamp(0.0, DEPTH_MAX_RANGE_MM));
            values.push(signal);
        }

        FramePayload::DepthArray(self.body(sample_id, "tof-sim", values))
    }

    fn spectral_frame(&mut self, sample_id: &SampleId) -> FramePayload {
        let values = self
            .profile
            .spectrum()
            .iter()
            .map(|&base| {
                if self.profile == QualityProfile::Saturated {
                    base
                } else {
                    let factor = 1.0 + self.rng.gen_range(-SPECTRAL_JITTER..=SPECTRAL_JITTER);
                    (base * factor).clamp(0.0, SENSOR_FULL_SCALE)
                }
            })
            .collect();

        FramePayload::Spectral(self.body(sample_id, "spectral-sim", values))
    }

    fn body(&self, sample_id: &SampleId, sensor_id: &str, raw_values: Vec<f64>) -> FrameBody {
        let mut metadata = FrameMetadata::new();
        metadata.insert("profile".to_string(), serde_json::Value::from(self.profile.to_string()));
        FrameBody {
            sensor_id: sensor_id.to_string(),
            sample_id: sample_id.clone(),
            timestamp: Some(chrono::Utc::now()),
            raw_values,
            metadata,
        }
    }
}
