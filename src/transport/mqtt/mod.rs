//! MQTT v5 broker transport built on rumqttc
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - pure option building and broker URL parsing
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`acks`] - pure matching of requests to their acknowledgements
//! - [`session`] - impure event loop driving and the [`RumqttcTransport`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use picontrol_mqtt::transport::mqtt::RumqttcTransport;
//! use picontrol_mqtt::transport::{BrokerTransport, InboundSink, SessionContext, SessionOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (inbound, _rx) = InboundSink::channel();
//! let (lost, _lost_rx) = tokio::sync::oneshot::channel();
//! let session = RumqttcTransport::new()
//!     .open(
//!         SessionOptions::new("broker.local", 1883, "ABC"),
//!         SessionContext { inbound, lost },
//!     )
//!     .await?;
//! session
//!     .subscribe("controller/ABC/devices", rumqttc::v5::mqttbytes::QoS::ExactlyOnce)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod acks;
pub mod connection;
pub mod message_handler;
pub mod session;

pub use acks::AckTracker;
pub use connection::{configure_mqtt_options, parse_broker_url};
pub use message_handler::{EventRoute, MessageHandler};
pub use session::{RumqttcSession, RumqttcTransport};
