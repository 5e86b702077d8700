//! Error taxonomy for the MQTT coordination layer
//!
//! Broker-facing failures (`ConnectionFailed`, `SubscriptionFailed`,
//! `PublishFailed`) propagate synchronously to whoever called `connect`,
//! `subscribe` or `publish`. Decode and handler failures never leave the
//! dispatcher: they are logged per handler and swallowed.

use crate::bridge::BridgeError;
use crate::protocol::codec::{DecodeError, EncodeError};
use crate::state::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connect/subscribe/publish and handler registration
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error("Serialization error")]
    Serialization(#[from] EncodeError),
    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl MqttError {
    /// Create a connection error from any displayable reason
    pub fn connection_failed<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionFailed(reason.into().into())
    }

    /// Create a subscription error
    pub fn subscription_failed<T: Into<String>, S: Into<String>>(topic: T, reason: S) -> Self {
        Self::SubscriptionFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a publish error
    pub fn publish_failed<T: Into<String>, S: Into<String>>(topic: T, reason: S) -> Self {
        Self::PublishFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of the broker session itself, including calls made
    /// while no session was available
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectionFailed(_) | MqttError::NotConnected { .. }
        )
    }
}

/// Failure raised by a handler's own logic
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn new<E: Into<Box<dyn std::error::Error + Send + Sync>>>(error: E) -> Self {
        Self::Failed(error.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.into())
    }
}

/// Result type handlers return
pub type HandlerResult = Result<(), HandlerError>;

/// Why a single handler did not complete for a single message
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Payload did not decode as {message_type}: {source}")]
    Decode {
        message_type: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("static regex is valid")
});

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Redact credential-looking fragments and cap the length of error text
/// before it reaches the logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
