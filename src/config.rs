//! Client configuration
//!
//! Loaded from a TOML file. Every section is optional; a missing section
//! takes its defaults so an empty file is a valid configuration.

use crate::discovery::{DiscoveredService, ServiceType};
use crate::manager::ClientSettings;
use crate::transport::mqtt::parse_broker_url;
use rumqttc::v5::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Shortest keep-alive accepted; brokers treat smaller values as abusive
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    /// Statically known services, used before discovery has resolved any
    #[serde(default)]
    pub services: Vec<ServiceSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Fixed device id; takes precedence over the identity file
    pub id: Option<String>,
    /// Where the generated id is kept
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: None,
            identity_file: default_identity_file(),
        }
    }
}

fn default_identity_file() -> PathBuf {
    PathBuf::from(".picontrol/device-id")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// `mqtt://host[:port]`; when absent the first discovered broker is used
    pub broker_url: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long the broker keeps the session after disconnect (default 7 days)
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u64,
    #[serde(default = "default_qos")]
    pub subscribe_qos: u8,
    #[serde(default = "default_qos")]
    pub publish_qos: u8,
    /// Bound on connect/subscribe/publish; unbounded when absent
    pub operation_timeout_secs: Option<u64>,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            keep_alive_secs: default_keep_alive(),
            session_expiry_secs: default_session_expiry(),
            subscribe_qos: default_qos(),
            publish_qos: default_qos(),
            operation_timeout_secs: None,
            io_threads: default_io_threads(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_session_expiry() -> u64 {
    7 * 24 * 60 * 60
}

fn default_qos() -> u8 {
    2
}

fn default_io_threads() -> usize {
    2
}

impl MqttSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        qos_from_level(self.subscribe_qos)?;
        qos_from_level(self.publish_qos)?;
        if self.operation_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "operation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(ConfigError::InvalidConfig(
                "io_threads must be at least 1".to_string(),
            ));
        }
        if let Some(url) = &self.broker_url {
            parse_broker_url(url)
                .map_err(|_| ConfigError::InvalidBrokerUrl(url.clone()))?;
        }
        Ok(())
    }

    /// Broker host and port, if a URL is configured
    pub fn broker_address(&self) -> Result<Option<(String, u16)>, ConfigError> {
        self.broker_url
            .as_deref()
            .map(|url| parse_broker_url(url).map_err(|_| ConfigError::InvalidBrokerUrl(url.into())))
            .transpose()
    }

    /// Runtime settings for a client identified by `client_id`
    pub fn client_settings(&self, client_id: &str) -> Result<ClientSettings, ConfigError> {
        let mut settings = ClientSettings::new(client_id);
        settings.keep_alive = Duration::from_secs(self.keep_alive_secs);
        settings.session_expiry = Duration::from_secs(self.session_expiry_secs);
        settings.subscribe_qos = qos_from_level(self.subscribe_qos)?;
        settings.publish_qos = qos_from_level(self.publish_qos)?;
        settings.operation_timeout = self.operation_timeout_secs.map(Duration::from_secs);
        settings.io_threads = self.io_threads;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// PiControl service whose broker login is used
    pub service_url: Option<String>,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            service_url: None,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".picontrol/credentials.json")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSeed {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    /// `_pictrl._tcp.` or `_mqtt._tcp.`
    #[serde(rename = "type")]
    pub service_type: String,
}

impl ServiceSeed {
    pub fn to_service(&self) -> Result<DiscoveredService, ConfigError> {
        let service_type = ServiceType::parse(&self.service_type).ok_or_else(|| {
            ConfigError::InvalidConfig(format!(
                "Unknown service type '{}' for {}",
                self.service_type, self.hostname
            ))
        })?;
        Ok(DiscoveredService {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            service_type,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.device.id {
            crate::protocol::topics::validate_device_id(id)
                .map_err(|e| ConfigError::InvalidDeviceId(format!("'{id}': {e}")))?;
        }
        self.mqtt.validate()?;
        for seed in &self.services {
            seed.to_service()?;
        }
        Ok(())
    }

    pub fn seeded_services(&self) -> Result<Vec<DiscoveredService>, ConfigError> {
        self.services.iter().map(ServiceSeed::to_service).collect()
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "ABC"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        Self::from_toml(toml_content).expect("Test config should parse")
    }
}

/// MQTT QoS for a numeric level 0..=2
pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidConfig(format!(
            "QoS level {other} is not one of 0, 1, 2"
        ))),
    }
}
