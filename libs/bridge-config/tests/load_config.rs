//! Configuration loading from TOML files.

use std::io::Write;

use bridge_config::BridgeConfig;
use tempfile::NamedTempFile;

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn load_full_file() {
    let file = write_toml(
        r#"
        [serial]
        port = "/dev/ttyAMA0"
        baud_rate = 19200
        parity = "even"

        [modbus]
        device_address = 5
        transaction_timeout_ms = 500
        max_retries = 2
        retry_backoff_ms = 50
        exponential_backoff = true

        [polling]
        poll_interval_ms = 2000
        discrete_inputs = { start = 0, count = 32 }
        coils = { start = 0, count = 32 }
        registers = { start = 100, count = 20 }

        [network]
        wifi_ssid = "plant-floor"
        wifi_password = "secret-pass"
        wifi_connect_timeout_ms = 10000
        "#,
    );

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.serial.port, "/dev/ttyAMA0");
    assert_eq!(config.serial.baud_rate, 19200);
    assert_eq!(config.modbus.device_address, 5);
    assert!(config.modbus.exponential_backoff);
    assert_eq!(config.polling.registers.start, 100);
    assert_eq!(config.network.wifi_ssid, "plant-floor");
    // Untouched sections keep defaults
    assert_eq!(config.scripts.tick_ms, 100);
}

#[test]
fn load_partial_file_fills_defaults() {
    let file = write_toml(
        r#"
        [modbus]
        device_address = 3
        "#,
    );

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.modbus.device_address, 3);
    assert_eq!(config.serial.baud_rate, 9600);
    assert_eq!(config.polling.coils.count, 16);
}

#[test]
fn invalid_file_is_rejected_at_load() {
    let file = write_toml(
        r#"
        [modbus]
        device_address = 0
        "#,
    );

    let err = BridgeConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("device_address"));
}

#[test]
fn missing_file_yields_defaults() {
    // Figment treats a missing TOML file as an empty provider
    let config = BridgeConfig::load("/nonexistent/bridge.toml").unwrap();
    assert_eq!(config.modbus.device_address, 1);
}
