//! PiControl MQTT client
//!
//! The coordination layer between a PiControl controller application and
//! its MQTT broker. It owns one broker session, lets application code
//! register typed handlers per topic, fans inbound messages out to them,
//! and exposes the asynchronous MQTT machinery through blocking calls.
//!
//! # Overview
//!
//! - [`protocol`]: message catalogue, JSON codec and topic layout
//! - [`registry`]: topic to handler table with handle-based cancellation
//! - [`dispatcher`]: isolated per-handler delivery of inbound messages
//! - [`manager`]: connection state machine and broker session lifecycle
//! - [`bridge`]: blocking calls over the async I/O runtime
//! - [`service`]: the facade application code uses
//! - [`transport`]: broker seam with a rumqttc implementation
//!
//! # Quick Start
//!
//! ```rust
//! use picontrol_mqtt::protocol::{decode, encode, Device, Devices, MessageHeader};
//!
//! let devices = Devices {
//!     header: MessageHeader::new("coordinator"),
//!     devices: vec![Device::new("d1")],
//! };
//!
//! let payload = encode(&devices).unwrap();
//! let decoded: Devices = decode(&payload).unwrap();
//! assert_eq!(decoded.devices[0].id, "d1");
//! ```

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod manager;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod state;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeError, SyncBridge};
pub use config::{ClientConfig, ConfigError};
pub use credentials::{CredentialStore, FileCredentialStore, ServiceCredentials};
pub use discovery::{DiscoveredService, ServiceDirectory, ServiceType};
pub use error::{DispatchError, HandlerError, HandlerResult, MqttError};
pub use identity::DeviceIdentity;
pub use manager::ClientSettings;
pub use registry::HandlerHandle;
pub use service::MqttClientService;
pub use state::ConnectionState;
pub use transport::BrokerCredentials;
