//! Configuration loading and validation tests
//!
//! Tests focus on behavior of loading files from disk and turning them into
//! client settings, not on TOML parsing details.

use picontrol_mqtt::config::{ClientConfig, ConfigError};
use picontrol_mqtt::discovery::ServiceType;
use rumqttc::v5::mqttbytes::QoS;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
id = "2F1C0B7E-1D4A-4C8B-9E3F-1234567890AB"

[mqtt]
broker_url = "mqtt://pi.local:1884"
keep_alive_secs = 20
session_expiry_secs = 3600

[credentials]
service_url = "http://pi.local:8080"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(
        config.device.id.as_deref(),
        Some("2F1C0B7E-1D4A-4C8B-9E3F-1234567890AB")
    );
    assert_eq!(
        config.mqtt.broker_address().unwrap(),
        Some(("pi.local".to_string(), 1884))
    );

    let settings = config.mqtt.client_settings("ABC").unwrap();
    assert_eq!(settings.client_id, "ABC");
    assert_eq!(settings.keep_alive, Duration::from_secs(20));
    assert_eq!(settings.session_expiry, Duration::from_secs(3600));
    assert_eq!(settings.publish_qos, QoS::ExactlyOnce);
}

#[test]
fn test_broker_url_without_port_uses_default() {
    let temp_file = write_config("[mqtt]\nbroker_url = \"mqtt://pi.local\"");

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(
        config.mqtt.broker_address().unwrap(),
        Some(("pi.local".to_string(), 1883))
    );
}

#[test]
fn test_service_seeds_are_loaded() {
    let temp_file = write_config(
        r#"
[[services]]
name = "PiControl"
hostname = "pi.local"
port = 8080
type = "_pictrl._tcp."

[[services]]
name = "Broker"
hostname = "pi.local"
port = 1883
type = "_mqtt._tcp."
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
    let services = config.seeded_services().unwrap();

    assert_eq!(services.len(), 2);
    assert_eq!(services[0].service_type, ServiceType::PiControl);
    assert_eq!(services[1].service_type, ServiceType::Mqtt);
    assert_eq!(services[1].port, 1883);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = ClientConfig::load_from_file(Path::new("/nonexistent/picontrol.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_wrong_field_type_is_a_parse_error() {
    let temp_file = write_config("[mqtt]\nkeep_alive_secs = \"sixty\"");
    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_validation_runs_on_load() {
    let temp_file = write_config("[mqtt]\nsubscribe_qos = 7");
    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_shown_config_loads_back() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://pi.local:1883"
operation_timeout_secs = 5
"#,
    );
    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    let shown = toml::to_string_pretty(&config).unwrap();
    let reloaded = ClientConfig::from_toml(&shown).unwrap();

    assert_eq!(reloaded, config);
}
