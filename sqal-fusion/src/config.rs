//! Configuration resolution for sqal-fusion
//!
//! Loads the bootstrap TOML (see [`SqalConfig::load_or_default`]) and layers
//! command-line / environment overrides on top.
//!
//! **Priority:** CLI flag (or its env var) → TOML file → built-in default

use sqal_common::config::SqalConfig;
use sqal_common::Result;
use std::path::PathBuf;
use tracing::info;

/// Values supplied on the command line (or via their env vars)
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

/// Where the effective configuration came from
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: SqalConfig,
    /// TOML file that was loaded, if any
    pub source: Option<PathBuf>,
}

/// Load the configuration file and apply overrides, then validate
pub fn resolve(overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let (mut config, source) = SqalConfig::load_or_default(overrides.config_path.as_deref())?;
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(ResolvedConfig { config, source })
}

/// Layer CLI values over a loaded configuration
pub fn apply_overrides(config: &mut SqalConfig, overrides: &ConfigOverrides) {
    if let Some(host) = &overrides.host {
        info!("Server host overridden from command line: {}", host);
        config.server.host = host.clone();
    }
    if let Some(port) = overrides.port {
        info!("Server port overridden from command line: {}", port);
        config.server.port = port;
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
}
