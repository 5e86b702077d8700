//! Broker transport abstraction
//!
//! The connection manager drives a broker only through [`BrokerTransport`]
//! and [`BrokerSession`]. The production implementation lives in [`mqtt`];
//! tests use the in-memory broker from `testing`.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod mqtt;

/// Keep-alive used when none is configured
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
/// How long the broker keeps a persistent session after disconnect
pub const DEFAULT_SESSION_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Username/password presented at connect time
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to open one broker session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    /// Stable per installation so the broker can resume the session
    pub client_id: String,
    pub credentials: Option<BrokerCredentials>,
    pub keep_alive: Duration,
    /// Zero keeps nothing after disconnect
    pub session_expiry: Duration,
    pub clean_start: bool,
}

impl SessionOptions {
    /// Persistent-session options with default keep-alive and expiry
    pub fn new<H: Into<String>, C: Into<String>>(host: H, port: u16, client_id: C) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            session_expiry: DEFAULT_SESSION_EXPIRY,
            clean_start: false,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<BrokerCredentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl OutboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Sending half of the dispatcher's inbound queue
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl InboundSink {
    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Returns false once the receiving side is gone.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Handed to [`BrokerTransport::open`]: where inbound messages go, and how
/// to report that an established session died
#[derive(Debug)]
pub struct SessionContext {
    pub inbound: InboundSink,
    pub lost: oneshot::Sender<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker refused the connection: {0}")]
    Refused(String),
    #[error("Transport error: {0}")]
    Io(String),
    #[error("Broker rejected subscription to {topic}: {reason}")]
    SubscriptionRejected { topic: String, reason: String },
    #[error("Broker rejected publish to {topic}: {reason}")]
    PublishRejected { topic: String, reason: String },
    #[error("Session closed")]
    Closed,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// Opens broker sessions
#[async_trait::async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Connect and resolve only once the broker acknowledged (or refused)
    /// the session
    async fn open(
        &self,
        options: SessionOptions,
        context: SessionContext,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// One established broker session
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Resolve when the broker acknowledged the subscription
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Resolve when the acknowledgement matching the message's QoS arrived
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Disconnect; no further inbound messages are delivered afterwards
    async fn close(&self) -> Result<(), TransportError>;

    /// Broker resumed a stored session for this client
    fn session_present(&self) -> bool;
}
