//! Typed PiControl messages exchanged over MQTT
//!
//! Every message carries a [`MessageHeader`] naming its logical source so the
//! receiving side knows where to address a reply.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A message type that can travel through the codec.
///
/// `TYPE_TAG` is written into every encoded payload and checked on decode,
/// so a payload for one type never decodes as another.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_TAG: &'static str;

    fn header(&self) -> &MessageHeader;
}

/// Header present on every message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageHeader {
    /// Logical sender, e.g. `controller/<device-id>`
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageHeader {
    /// Header without a timestamp
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            timestamp: None,
        }
    }

    /// Header stamped with the current time
    pub fn now<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Ask the coordinator for the devices it knows about
///
/// # Examples
/// ```
/// use picontrol_mqtt::protocol::{DevicesRequest, MessageHeader};
///
/// let request = DevicesRequest {
///     header: MessageHeader::new("controller/ABC"),
/// };
/// assert_eq!(request.header.source, "controller/ABC");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicesRequest {
    pub header: MessageHeader,
}

impl Message for DevicesRequest {
    const TYPE_TAG: &'static str = "picontrol.DevicesRequest";

    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

/// A controllable device known to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub paired: bool,
}

impl Device {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            paired: false,
        }
    }
}

/// Coordinator reply listing devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Devices {
    pub header: MessageHeader,
    pub devices: Vec<Device>,
}

impl Message for Devices {
    const TYPE_TAG: &'static str = "picontrol.Devices";

    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

/// Ask for the accessories that registered themselves with the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessoriesRequest {
    pub header: MessageHeader,
}

impl Message for AccessoriesRequest {
    const TYPE_TAG: &'static str = "picontrol.AccessoriesRequest";

    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

/// Hardware accessory attached to a device (relay, sensor, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Accessory {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Accessories available for pairing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Accessories {
    pub header: MessageHeader,
    pub accessories: Vec<Accessory>,
}

impl Message for Accessories {
    const TYPE_TAG: &'static str = "picontrol.Accessories";

    fn header(&self) -> &MessageHeader {
        &self.header
    }
}
