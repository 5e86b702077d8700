//! Blocking client facade
//!
//! [`MqttClientService`] is what application code talks to. Every call that
//! needs the broker goes through the [`SyncBridge`], so it blocks only the
//! calling thread while the session's I/O keeps running on the runtime.
//!
//! ```rust,no_run
//! use picontrol_mqtt::manager::ClientSettings;
//! use picontrol_mqtt::protocol::{Devices, DevicesRequest, MessageHeader, TopicBuilder};
//! use picontrol_mqtt::service::MqttClientService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let topics = TopicBuilder::new("ABC")?;
//! let client = MqttClientService::new(ClientSettings::new("ABC"))?;
//! client.connect("broker.local", 1883, None)?;
//!
//! client.add_handler(&topics.devices_reply(), |devices: Devices| {
//!     println!("{} devices", devices.devices.len());
//!     Ok(())
//! })?;
//! client.publish(
//!     &TopicBuilder::devices_request(),
//!     &DevicesRequest { header: MessageHeader::now(topics.source()) },
//! )?;
//! # Ok(())
//! # }
//! ```

use crate::bridge::{BridgeError, SyncBridge};
use crate::dispatcher::{DispatchStatsSnapshot, Dispatcher, DispatcherHandle};
use crate::error::{HandlerResult, MqttError};
use crate::manager::{ClientSettings, ConnectionManager};
use crate::protocol::codec::encode;
use crate::protocol::messages::Message;
use crate::protocol::topics::validate_handler_topic;
use crate::registry::{HandlerHandle, HandlerRegistry};
use crate::state::{ConnectionState, StateWatcher};
use crate::transport::mqtt::RumqttcTransport;
use crate::transport::{BrokerCredentials, BrokerTransport, OutboundMessage};
use rumqttc::v5::mqttbytes::QoS;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

pub struct MqttClientService {
    manager: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    dispatcher: DispatcherHandle,
    // Dropped last: shutting the runtime down ends the session tasks
    bridge: SyncBridge,
}

impl MqttClientService {
    /// Client talking to a real broker over rumqttc
    pub fn new(settings: ClientSettings) -> Result<Self, MqttError> {
        Self::with_transport(settings, Arc::new(RumqttcTransport::new()))
    }

    /// Client over any broker transport
    pub fn with_transport(
        settings: ClientSettings,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, MqttError> {
        let bridge = SyncBridge::new(settings.io_threads)?;
        let registry = Arc::new(HandlerRegistry::new());

        let (inbound, dispatcher) = Dispatcher::new(registry.clone())
            .spawn()
            .map_err(BridgeError::DispatcherStart)?;

        let manager = Arc::new(ConnectionManager::new(
            transport,
            inbound,
            registry.clone(),
            settings,
        ));

        Ok(Self {
            manager,
            registry,
            dispatcher,
            bridge,
        })
    }

    /// Open a session with the broker and block until it is acknowledged
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        credentials: Option<BrokerCredentials>,
    ) -> Result<(), MqttError> {
        let manager = self.manager.clone();
        let span = crate::mqtt_span!(operation = "connect", host = %host, port);
        let host = host.to_string();
        self.bridge.run_blocking(
            async move { manager.connect(&host, port, credentials).await }.instrument(span),
        )
    }

    /// Register `handler` for messages of type `M` on `topic`.
    ///
    /// The first handler for a topic subscribes at the broker and blocks
    /// until the subscription is acknowledged; if that fails the handler is
    /// not registered. Later handlers for the same topic wait for that
    /// subscribe to settle and share its outcome.
    pub fn add_handler<M, F>(&self, topic: &str, handler: F) -> Result<HandlerHandle, MqttError>
    where
        M: Message,
        F: Fn(M) -> HandlerResult + Send + Sync + 'static,
    {
        validate_handler_topic(topic).map_err(|e| MqttError::InvalidTopic {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let registration = self.registry.register::<M, F>(topic, handler);
        if registration.first_for_topic {
            let result = self.subscribe(topic);
            let outcome = result.as_ref().map(|_| ()).map_err(subscribe_failure_reason);
            self.registry.subscription_settled(&registration, outcome);
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "Rolled back handlers after failed subscribe");
                return Err(e);
            }
        } else if let Err(reason) = registration.subscription.wait() {
            return Err(MqttError::SubscriptionFailed {
                topic: topic.to_string(),
                reason,
            });
        }

        info!(
            topic = %topic,
            message_type = M::TYPE_TAG,
            handlers = self.registry.handler_count(topic),
            "Handler added"
        );
        Ok(registration.handle)
    }

    /// Stop dispatching to a handler. Safe to call more than once.
    ///
    /// The broker subscription is kept even when this was the last handler
    /// for the topic.
    pub fn remove_handler(&self, handle: &HandlerHandle) -> bool {
        self.registry.cancel(handle)
    }

    /// Subscribe to `topic` at the configured QoS and wait for the SubAck
    pub fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.subscribe_with_qos(topic, self.manager.settings().subscribe_qos)
    }

    pub fn subscribe_with_qos(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let manager = self.manager.clone();
        let span = crate::mqtt_span!(operation = "subscribe", topic = %topic);
        let topic = topic.to_string();
        self.bridge
            .run_blocking(async move { manager.subscribe(&topic, qos).await }.instrument(span))
    }

    /// Encode and publish `message`, waiting for the broker's acknowledgement
    pub fn publish<M: Message>(&self, topic: &str, message: &M) -> Result<(), MqttError> {
        self.publish_with_qos(topic, message, self.manager.settings().publish_qos)
    }

    pub fn publish_with_qos<M: Message>(
        &self,
        topic: &str,
        message: &M,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let payload = encode(message)?;
        let manager = self.manager.clone();
        let span = crate::mqtt_span!(
            operation = "publish",
            topic = %topic,
            message_type = M::TYPE_TAG
        );
        let outbound = OutboundMessage::new(topic, payload, qos);
        self.bridge
            .run_blocking(async move { manager.publish(outbound).await }.instrument(span))
    }

    /// Close the session; handlers stay registered
    pub fn disconnect(&self) -> Result<(), MqttError> {
        let manager = self.manager.clone();
        self.bridge
            .run_blocking(async move { manager.disconnect().await })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Observe the current state and every later transition
    pub fn watch_state(&self) -> StateWatcher {
        self.manager.watch_state()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.registry.handler_count(topic)
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }
}

/// Reason handed to registrants that waited on a failed subscribe
fn subscribe_failure_reason(error: &MqttError) -> String {
    match error {
        MqttError::SubscriptionFailed { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}
