//! Broker session lifecycle
//!
//! The [`ConnectionManager`] owns the single session slot and is the only
//! writer of [`ConnectionState`]. The slot lock is held for the whole of
//! `connect`, so a subscribe or publish issued meanwhile waits and then sees
//! the outcome.

use crate::error::{sanitize_error_message, MqttError};
use crate::registry::HandlerRegistry;
use crate::state::{ConnectionEvent, ConnectionState, StateCell, StateWatcher};
use crate::transport::{
    BrokerCredentials, BrokerSession, BrokerTransport, InboundSink, OutboundMessage,
    SessionContext, SessionOptions, TransportError, DEFAULT_KEEP_ALIVE, DEFAULT_SESSION_EXPIRY,
};
use rumqttc::v5::mqttbytes::QoS;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

type SessionSlot = Arc<Mutex<Option<Arc<dyn BrokerSession>>>>;

/// Session parameters that stay fixed for the life of the client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    pub keep_alive: Duration,
    pub session_expiry: Duration,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    /// Bound on each broker operation; `None` waits forever
    pub operation_timeout: Option<Duration>,
    pub io_threads: usize,
}

impl ClientSettings {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            session_expiry: DEFAULT_SESSION_EXPIRY,
            subscribe_qos: QoS::ExactlyOnce,
            publish_qos: QoS::ExactlyOnce,
            operation_timeout: None,
            io_threads: 2,
        }
    }

    fn session_options(
        &self,
        host: &str,
        port: u16,
        credentials: Option<BrokerCredentials>,
    ) -> SessionOptions {
        let mut options =
            SessionOptions::new(host, port, &self.client_id).with_credentials(credentials);
        options.keep_alive = self.keep_alive;
        options.session_expiry = self.session_expiry;
        options
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    inbound: InboundSink,
    registry: Arc<HandlerRegistry>,
    state: Arc<StateCell>,
    session: SessionSlot,
    /// Bumped whenever a session is replaced, so a loss report from an old
    /// session is ignored
    generation: Arc<AtomicU64>,
    settings: ClientSettings,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        inbound: InboundSink,
        registry: Arc<HandlerRegistry>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            transport,
            inbound,
            registry,
            state: Arc::new(StateCell::new()),
            session: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            settings,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn watch_state(&self) -> StateWatcher {
        self.state.watch()
    }

    /// Open a session, replacing any existing one
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        credentials: Option<BrokerCredentials>,
    ) -> Result<(), MqttError> {
        let mut slot = self.session.lock().await;

        if let Some(previous) = slot.take() {
            info!("Replacing existing MQTT session");
            self.generation.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Error closing previous MQTT session");
            }
        }
        if self.state.current() != ConnectionState::Disconnected {
            self.state.apply(ConnectionEvent::TornDown);
        }

        self.state.apply(ConnectionEvent::ConnectRequested);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let (lost_tx, lost_rx) = oneshot::channel();
        let context = SessionContext {
            inbound: self.inbound.clone(),
            lost: lost_tx,
        };
        let options = self.settings.session_options(host, port, credentials);

        let opened = match bounded(
            self.settings.operation_timeout,
            self.transport.open(options, context),
        )
        .await
        {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(MqttError::ConnectionFailed(Box::new(e))),
            Err(timeout) => Err(MqttError::ConnectionFailed(Box::new(timeout))),
        };

        let session: Arc<dyn BrokerSession> = match opened {
            Ok(session) => Arc::from(session),
            Err(e) => {
                self.state.apply(ConnectionEvent::HandshakeFailed(
                    sanitize_error_message(&e.to_string()),
                ));
                return Err(e);
            }
        };

        self.state.apply(ConnectionEvent::HandshakeSucceeded);
        self.watch_for_loss(lost_rx, generation);

        if !session.session_present() {
            self.resubscribe(session.as_ref()).await;
        }

        *slot = Some(session);
        Ok(())
    }

    /// Restore broker subscriptions for every topic that has handlers
    async fn resubscribe(&self, session: &dyn BrokerSession) {
        for topic in self.registry.topics() {
            let result = bounded(
                self.settings.operation_timeout,
                session.subscribe(&topic, self.settings.subscribe_qos),
            )
            .await;
            match result {
                Ok(Ok(())) => debug!(topic = %topic, "Resubscribed after new session"),
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Resubscription failed"),
                Err(e) => warn!(topic = %topic, error = %e, "Resubscription failed"),
            }
        }
    }

    fn watch_for_loss(&self, lost: oneshot::Receiver<String>, generation: u64) {
        let session = self.session.clone();
        let state = self.state.clone();
        let current_generation = self.generation.clone();

        tokio::spawn(async move {
            // A dropped sender means the session ended locally
            let Ok(reason) = lost.await else {
                return;
            };

            let mut slot = session.lock().await;
            if current_generation.load(Ordering::Acquire) == generation {
                slot.take();
                state.apply(ConnectionEvent::ConnectionLost(reason));
            } else {
                debug!("Ignoring loss report from a replaced session");
            }
        });
    }

    /// The live session, waiting for an in-progress connect to finish
    async fn connected_session(&self) -> Result<Arc<dyn BrokerSession>, MqttError> {
        let slot = self.session.lock().await;
        match (slot.as_ref(), self.state.current()) {
            (Some(session), ConnectionState::Connected) => Ok(session.clone()),
            (_, state) => Err(MqttError::NotConnected { state }),
        }
    }

    /// Subscribe and wait for the broker's SubAck
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let session = self.connected_session().await?;
        debug!(topic = %topic, qos = ?qos, "Subscribing");

        bounded(self.settings.operation_timeout, session.subscribe(topic, qos))
            .await?
            .map_err(|e| MqttError::subscription_failed(topic, describe(&e)))?;

        info!(topic = %topic, "Subscribed");
        Ok(())
    }

    /// Publish and wait for the acknowledgement matching the message's QoS
    pub async fn publish(&self, message: OutboundMessage) -> Result<(), MqttError> {
        let session = self.connected_session().await?;
        let topic = message.topic.clone();
        debug!(topic = %topic, qos = ?message.qos, bytes = message.payload.len(), "Publishing");

        bounded(self.settings.operation_timeout, session.publish(message))
            .await?
            .map_err(|e| MqttError::publish_failed(&topic, describe(&e)))
    }

    /// Close the session if there is one
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            debug!("Disconnect requested with no active session");
            return Ok(());
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        let closed = session.close().await;
        self.state.apply(ConnectionEvent::TornDown);

        closed.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))
    }
}

fn describe(error: &TransportError) -> String {
    sanitize_error_message(&error.to_string())
}

async fn bounded<F: Future>(limit: Option<Duration>, work: F) -> Result<F::Output, MqttError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| MqttError::Timeout(limit)),
        None => Ok(work.await),
    }
}
