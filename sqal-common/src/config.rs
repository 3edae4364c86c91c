//! Bootstrap configuration loading
//!
//! Configuration file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `SQAL_CONFIG` environment variable
//! 3. User config file (`<config_dir>/sqal/sqal.toml`)
//! 4. System config file (`/etc/sqal/sqal.toml`, Linux only)
//! 5. Built-in defaults (fallback)
//!
//! Every field is defaulted, so a partial TOML file only overrides what it names.

use crate::types::{Modality, SPECTRAL_CHANNELS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "SQAL_CONFIG";

/// Complete bootstrap configuration for the SQAL fusion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SqalConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub fusion: FusionConfig,
    pub delivery: DeliveryConfig,
    pub depth: DepthCalibration,
    pub spectral: SpectralCalibration,
}

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Default: 5790
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5790
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stdout only if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Fusion engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// How long a sample waits for its remaining modalities (ms)
    pub timeout_ms: u64,
    /// Sub-score gap above which a result is flagged for manual review
    pub disagreement_threshold: f64,
    /// Minimum composite score for grade A
    pub grade_a: f64,
    /// Minimum composite score for grade B
    pub grade_b: f64,
    /// Minimum composite score for grade C (below: Reject)
    pub grade_c: f64,
    /// Fused results kept for idempotent lookups and replay protection
    pub retention: usize,
    /// Modalities a sample needs before it fuses without waiting
    pub expected_modalities: Vec<Modality>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            disagreement_threshold: 0.3,
            grade_a: 0.85,
            grade_b: 0.60,
            grade_c: 0.40,
            retention: 10_000,
            expected_modalities: Modality::ALL.to_vec(),
        }
    }
}

/// Live delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-consumer outbound queue capacity
    pub queue_capacity: usize,
    /// Keep-alive interval for live connections (seconds)
    pub heartbeat_secs: u64,
    /// Service EventBus capacity
    pub event_bus_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            heartbeat_secs: 15,
            event_bus_capacity: 256,
        }
    }
}

/// Time-of-flight calibration constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthCalibration {
    /// Sensor-to-conveyor distance (mm); an empty belt reads this range
    pub reference_distance_mm: f64,
    /// Range standard deviation at which surface uniformity reaches 0 (mm)
    pub uniformity_tolerance_mm: f64,
    /// Thickness that earns a full thickness score (mm)
    pub target_thickness_mm: f64,
    /// Footprint of one zone on the conveyor plane (mm²)
    pub zone_area_mm2: f64,
    /// Normalized signal variance at which confidence drops to 0.5
    pub noise_reference: f64,
    pub uniformity_weight: f64,
    pub thickness_weight: f64,
}

impl Default for DepthCalibration {
    fn default() -> Self {
        Self {
            reference_distance_mm: 120.0,
            uniformity_tolerance_mm: 8.0,
            target_thickness_mm: 50.0,
            zone_area_mm2: 100.0,
            noise_reference: 0.01,
            uniformity_weight: 0.5,
            thickness_weight: 0.5,
        }
    }
}

/// Named ratio between two spectral channels with its calibrated band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioBand {
    pub name: String,
    /// Numerator channel, 1-based (F1..F8)
    pub numerator: usize,
    /// Denominator channel, 1-based (F1..F8)
    pub denominator: usize,
    pub ideal_min: f64,
    pub ideal_max: f64,
    /// Distance outside the ideal band at which the ratio score reaches 0
    pub tolerance: f64,
}

impl RatioBand {
    fn new(
        name: &str,
        numerator: usize,
        denominator: usize,
        ideal_min: f64,
        ideal_max: f64,
        tolerance: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            numerator,
            denominator,
            ideal_min,
            ideal_max,
            tolerance,
        }
    }
}

/// Spectral sensor calibration constants
///
/// Signal fractions are of the total full-scale magnitude (8 × 65535).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralCalibration {
    pub ratios: Vec<RatioBand>,
    /// At or below this fraction the reading carries no confidence
    pub floor_fraction: f64,
    /// Confidence reaches 1.0 here
    pub healthy_low: f64,
    /// Confidence starts falling again above this fraction
    pub healthy_high: f64,
    /// At or above this fraction the reading carries no confidence
    pub saturation_fraction: f64,
}

impl Default for SpectralCalibration {
    fn default() -> Self {
        Self {
            ratios: vec![
                RatioBand::new("oxidation_ratio", 3, 7, 0.50, 0.75, 0.35),
                RatioBand::new("color_balance", 5, 8, 1.20, 1.70, 0.60),
                RatioBand::new("lipid_ratio", 6, 2, 2.00, 2.70, 1.00),
            ],
            floor_fraction: 0.02,
            healthy_low: 0.10,
            healthy_high: 0.85,
            saturation_fraction: 0.98,
        }
    }
}

impl SqalConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Resolve the config file by priority and load it, or fall back to defaults
    ///
    /// Returns the configuration and the file it came from, if any.
    pub fn load_or_default(cli_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match resolve_config_path(cli_path) {
            Some(path) => {
                let config = Self::load(&path)?;
                Ok((config, Some(path)))
            }
            None => {
                debug!("No configuration file found, using built-in defaults");
                Ok((Self::default(), None))
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let fusion = &self.fusion;
        if fusion.timeout_ms == 0 {
            return Err(invalid("fusion.timeout_ms must be greater than 0"));
        }
        if !(fusion.disagreement_threshold > 0.0 && fusion.disagreement_threshold <= 1.0) {
            return Err(invalid("fusion.disagreement_threshold must be within (0, 1]"));
        }
        if !(fusion.grade_a <= 1.0
            && fusion.grade_a > fusion.grade_b
            && fusion.grade_b > fusion.grade_c
            && fusion.grade_c > 0.0)
        {
            return Err(invalid(
                "grade cut points must satisfy 1 >= grade_a > grade_b > grade_c > 0",
            ));
        }
        if fusion.retention == 0 {
            return Err(invalid("fusion.retention must be greater than 0"));
        }
        if fusion.expected_modalities.is_empty() {
            return Err(invalid("fusion.expected_modalities must name at least one modality"));
        }

        if self.delivery.queue_capacity == 0 {
            return Err(invalid("delivery.queue_capacity must be greater than 0"));
        }
        if self.delivery.heartbeat_secs == 0 {
            return Err(invalid("delivery.heartbeat_secs must be greater than 0"));
        }

        let depth = &self.depth;
        if depth.reference_distance_mm <= 0.0
            || depth.uniformity_tolerance_mm <= 0.0
            || depth.target_thickness_mm <= 0.0
            || depth.zone_area_mm2 <= 0.0
            || depth.noise_reference <= 0.0
        {
            return Err(invalid(
                "depth calibration distances, areas and noise reference must be positive",
            ));
        }
        if depth.uniformity_weight < 0.0
            || depth.thickness_weight < 0.0
            || (depth.uniformity_weight + depth.thickness_weight - 1.0).abs() > 1e-6
        {
            return Err(invalid("depth sub-score weights must be non-negative and sum to 1"));
        }

        let spectral = &self.spectral;
        if !(0.0 <= spectral.floor_fraction
            && spectral.floor_fraction < spectral.healthy_low
            && spectral.healthy_low <= spectral.healthy_high
            && spectral.healthy_high < spectral.saturation_fraction
            && spectral.saturation_fraction <= 1.0)
        {
            return Err(invalid(
                "spectral fractions must satisfy \
                 0 <= floor < healthy_low <= healthy_high < saturation <= 1",
            ));
        }
        if spectral.ratios.is_empty() {
            return Err(invalid("spectral.ratios must define at least one ratio"));
        }
        for band in &spectral.ratios {
            let channels = 1..=SPECTRAL_CHANNELS;
            if !channels.contains(&band.numerator) || !channels.contains(&band.denominator) {
                return Err(invalid(&format!(
                    "ratio '{}' names a channel outside F1..F8",
                    band.name
                )));
            }
            if band.ideal_min > band.ideal_max || band.tolerance <= 0.0 {
                return Err(invalid(&format!(
                    "ratio '{}' has an empty band or non-positive tolerance",
                    band.name
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::Config(message.to_string())
}

/// Find the configuration file following the documented priority order
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument (taken as-is; a missing file is a load error)
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    if let Some(path) = dirs::config_dir().map(|d| d.join("sqal").join("sqal.toml")) {
        if path.exists() {
            return Some(path);
        }
    }

    // Priority 4: System config (Linux)
    if cfg!(target_os = "linux") {
        let system = PathBuf::from("/etc/sqal/sqal.toml");
        if system.exists() {
            return Some(system);
        }
    }

    None
}

/// Write configuration as TOML atomically (temp file + rename)
pub fn write_toml_config(config: &SqalConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SqalConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SqalConfig::from_toml_str(
            r#"
            [server]
            port = 6000

            [fusion]
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.fusion.timeout_ms, 500);
        assert_eq!(config.fusion.grade_b, 0.60);
        assert_eq!(config.delivery.queue_capacity, 64);
        assert_eq!(config.spectral.ratios.len(), 3);
    }

    #[test]
    fn test_non_monotonic_grades_rejected() {
        let mut config = SqalConfig::default();
        config.fusion.grade_b = 0.9;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_depth_weights_must_sum_to_one() {
        let mut config = SqalConfig::default();
        config.depth.thickness_weight = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ratio_channel_out_of_range_rejected() {
        let mut config = SqalConfig::default();
        config.spectral.ratios[0].denominator = 9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("oxidation_ratio"));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = SqalConfig::default();
        config.delivery.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SqalConfig::from_toml_str("[server\nport = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
