//! Pure MQTT option building for the rumqttc session
//!
//! This module turns [`SessionOptions`] into rumqttc's `MqttOptions` and
//! parses broker URLs from configuration.

use crate::transport::{SessionOptions, TransportError};
use rumqttc::v5::mqttbytes::v5::ConnectProperties;
use rumqttc::v5::MqttOptions;
use url::Url;

/// Default MQTT port for plain TCP
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build rumqttc options for a persistent MQTT v5 session
pub fn configure_mqtt_options(options: &SessionOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);

    mqtt_options.set_clean_start(options.clean_start);
    mqtt_options.set_connect_properties(connect_properties(options));

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);

    mqtt_options
}

/// CONNECT properties carrying the session expiry and packet size limit.
/// Without an expiry the broker discards a v5 session on disconnect, even
/// with clean start off.
fn connect_properties(options: &SessionOptions) -> ConnectProperties {
    let expiry = u32::try_from(options.session_expiry.as_secs()).unwrap_or(u32::MAX);

    let mut properties = ConnectProperties::new();
    properties.session_expiry_interval = (expiry > 0).then_some(expiry);
    properties.max_packet_size = Some(MAX_PACKET_SIZE);
    properties
}

/// Split an `mqtt://host:port` URL into host and port
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16), TransportError> {
    let url = Url::parse(broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

    if url.scheme() != "mqtt" && url.scheme() != "tcp" {
        return Err(TransportError::InvalidBrokerUrl(broker_url.to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);

    Ok((host.to_string(), port))
}
