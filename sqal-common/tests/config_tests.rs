//! Configuration resolution and TOML persistence tests
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate SQAL_CONFIG are marked with #[serial].

use serial_test::serial;
use sqal_common::config::{resolve_config_path, write_toml_config, SqalConfig, CONFIG_ENV_VAR};
use sqal_common::Modality;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_cli_path_wins_over_environment() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let cli = PathBuf::from("/tmp/from-cli.toml");
    let resolved = resolve_config_path(Some(&cli));

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(cli));
}

#[test]
#[serial]
fn test_environment_variable_used_without_cli() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolved = resolve_config_path(None);

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));
}

#[test]
#[serial]
fn test_load_or_default_reads_env_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("sqal.toml");
    std::fs::write(
        &path,
        r#"
        [delivery]
        queue_capacity = 8

        [fusion]
        expected_modalities = ["spectral"]
        "#,
    )
    .unwrap();

    env::set_var(CONFIG_ENV_VAR, &path);
    let (config, source) = SqalConfig::load_or_default(None).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(source, Some(path));
    assert_eq!(config.delivery.queue_capacity, 8);
    assert_eq!(config.fusion.expected_modalities, vec![Modality::Spectral]);
    config.validate().unwrap();
}

#[test]
fn test_missing_cli_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let result = SqalConfig::load_or_default(Some(&missing));
    assert!(result.is_err(), "explicitly requested config must exist");
}

#[test]
fn test_write_then_load_preserves_every_section() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("sqal.toml");

    let mut config = SqalConfig::default();
    config.server.port = 7001;
    config.logging.level = "debug".to_string();
    config.logging.file = Some(PathBuf::from("/var/log/sqal.log"));
    config.fusion.disagreement_threshold = 0.25;
    config.depth.reference_distance_mm = 140.0;
    config.spectral.ratios[1].ideal_max = 1.9;

    write_toml_config(&config, &path).unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("toml.tmp").exists(), "temp file should be renamed away");

    let loaded = SqalConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_overwrite_replaces_previous_content() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("sqal.toml");

    let mut first = SqalConfig::default();
    first.server.port = 6001;
    write_toml_config(&first, &path).unwrap();

    let mut second = SqalConfig::default();
    second.server.port = 6002;
    write_toml_config(&second, &path).unwrap();

    let loaded = SqalConfig::load(&path).unwrap();
    assert_eq!(loaded.server.port, 6002);
}
