//! Topic naming and validation for PiControl
//!
//! Topics follow `<role>/<subject>`: the coordinator answers on
//! `coordinator/...`, each controller listens on `controller/<device-id>/...`.
//! Handler topics are matched byte-exact, so wildcards are refused.

use thiserror::Error;

/// Role prefix of the coordinator service
pub const COORDINATOR: &str = "coordinator";
/// Role prefix of a controller (this app)
pub const CONTROLLER: &str = "controller";

/// Builds the topics used by a given controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    device_id: String,
}

impl TopicBuilder {
    pub fn new<S: Into<String>>(device_id: S) -> Result<Self, TopicError> {
        let device_id = device_id.into();
        validate_device_id(&device_id)?;
        Ok(Self { device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Logical source of messages sent by this controller
    pub fn source(&self) -> String {
        format!("{CONTROLLER}/{}", self.device_id)
    }

    /// Where device list requests are sent
    pub fn devices_request() -> String {
        format!("{COORDINATOR}/devices")
    }

    /// Where this controller receives device lists
    pub fn devices_reply(&self) -> String {
        format!("{}/devices", self.source())
    }

    /// Where accessory announcements for `source` are published
    pub fn accessories_of(source: &str) -> String {
        format!("{}/accessories", source.trim_end_matches('/'))
    }

    /// Where accessory list requests are sent
    pub fn accessories_request() -> String {
        format!("{COORDINATOR}/accessories")
    }

    /// Where this controller receives accessory lists
    pub fn accessories_reply(&self) -> String {
        Self::accessories_of(&self.source())
    }
}

/// Check that a topic can carry handlers: non-empty, no wildcards, no NUL
pub fn validate_handler_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    for ch in topic.chars() {
        match ch {
            '+' | '#' => return Err(TopicError::Wildcard(ch)),
            '\0' => return Err(TopicError::InvalidChar(ch)),
            _ => {}
        }
    }

    Ok(())
}

/// Device ids become a topic level, so they are restricted to a safe set
pub fn validate_device_id(device_id: &str) -> Result<(), TopicError> {
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(TopicError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains wildcard '{0}', handlers match topics exactly")]
    Wildcard(char),
    #[error("Topic contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}
