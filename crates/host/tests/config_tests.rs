//! Configuration Integration Tests
//!
//! # Test Scenarios
//! - Save and load through the filesystem
//! - Partial files fall back to defaults per field
//! - Invalid files are rejected with context
//!
//! Run with: `cargo test -p host --test config_tests`

use host::HostConfig;
use host::config::{SimCdcConfig, SimDeviceConfig};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn sample_device() -> SimDeviceConfig {
    SimDeviceConfig {
        address: 5,
        vendor_id: 0x2E8A,
        product_id: 0x000A,
        class: 0xEF,
        subclass: 0x02,
        protocol: 0x01,
        manufacturer: Some("Raspberry Pi".to_string()),
        product: Some("Pico".to_string()),
        serial: None,
        cdc: vec![SimCdcConfig {
            index: 0,
            echo: true,
        }],
        msc: Vec::new(),
        hid: Vec::new(),
    }
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.host.log_level = "debug".to_string();
    config.cdc.write_idle_timeout = Duration::from_millis(250);
    config.msc.transfer_timeout = Duration::from_secs(90);
    config.scheduler.queue_depth = 16;
    config.sim.devices.push(sample_device());
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.host.log_level, "debug");
    assert_eq!(loaded.cdc.write_idle_timeout, Duration::from_millis(250));
    assert_eq!(loaded.msc.transfer_timeout, Duration::from_secs(90));
    assert_eq!(loaded.scheduler.queue_depth, 16);
    assert_eq!(loaded.sim.devices.len(), 1);
    assert_eq!(loaded.sim.devices[0].product.as_deref(), Some("Pico"));
    assert!(loaded.sim.devices[0].cdc[0].echo);
}

#[test]
fn test_partial_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(
        &path,
        r#"
[cdc]
read_timeout = "250ms"

[threading]
max_threads = 4
"#,
    )
    .unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.cdc.read_timeout, Duration::from_millis(250));
    assert_eq!(config.cdc.write_idle_timeout, Duration::from_millis(500));
    assert_eq!(config.threading.max_threads, 4);
    assert_eq!(config.threading.default_stack_size, 5120);
    assert_eq!(config.host.log_level, "info");
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host.toml");

    fs::write(&path, "[host]\nlog_level = \"loud\"\n").unwrap();
    assert!(HostConfig::load(Some(path.clone())).is_err());

    fs::write(&path, "[scheduler]\nqueue_depth = 0\n").unwrap();
    assert!(HostConfig::load(Some(path.clone())).is_err());

    fs::write(&path, "[msc]\ntransfer_timeout = \"soon\"\n").unwrap();
    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
