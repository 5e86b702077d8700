//! rumqttc-backed broker sessions (impure I/O)

use super::acks::{AckReceiver, AckTracker, QueuedRequest};
use super::connection::configure_mqtt_options;
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::sanitize_error_message;
use crate::transport::{
    BrokerSession, BrokerTransport, InboundSink, OutboundMessage, SessionContext, SessionOptions,
    TransportError,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of rumqttc's request channel
const REQUEST_CAPACITY: usize = 64;
/// How long `close` waits for the event loop to flush the Disconnect
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens MQTT v5 sessions with rumqttc
#[derive(Debug, Clone)]
pub struct RumqttcTransport {
    request_capacity: usize,
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self {
            request_capacity: REQUEST_CAPACITY,
        }
    }
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BrokerTransport for RumqttcTransport {
    async fn open(
        &self,
        options: SessionOptions,
        context: SessionContext,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        let mqtt_options = configure_mqtt_options(&options);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);

        let session_present = await_connack(&mut eventloop).await?;
        info!(session_present, "MQTT broker accepted session");

        let tracker = Arc::new(Mutex::new(AckTracker::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            tracker.clone(),
            context,
            closing.clone(),
        ));

        Ok(Box::new(RumqttcSession {
            client,
            tracker,
            writer: tokio::sync::Mutex::new(()),
            closing,
            session_present,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// Poll until the broker answers the Connect
async fn await_connack(eventloop: &mut EventLoop) -> Result<bool, TransportError> {
    loop {
        let event = eventloop.poll().await.map_err(classify_connection_error)?;
        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged {
                session_present,
                result,
            } => return result.map(|()| session_present).map_err(TransportError::Refused),
            other => trace!(route = ?other, "Event before ConnAck"),
        }
    }
}

fn classify_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::Io(sanitize_error_message(&other.to_string())),
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    tracker: Arc<Mutex<AckTracker>>,
    context: SessionContext,
    closing: Arc<AtomicBool>,
) {
    let SessionContext { inbound, lost } = context;

    let reason = loop {
        match eventloop.poll().await {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                if let Some(reason) = apply_route(route, &tracker, &inbound) {
                    break reason;
                }
            }
            Err(e) => break sanitize_error_message(&e.to_string()),
        }
    };

    tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .fail_all();

    if closing.load(Ordering::Acquire) {
        debug!("MQTT event loop finished after local close");
    } else {
        report_lost(lost, reason);
    }
}

/// Act on one routed event; `Some(reason)` ends the session
fn apply_route(
    route: EventRoute,
    tracker: &Mutex<AckTracker>,
    inbound: &InboundSink,
) -> Option<String> {
    let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
    match route {
        EventRoute::MessageReceived(message) => {
            trace!(topic = %message.topic, "Inbound publish");
            if !inbound.deliver(message) {
                warn!("Dispatcher queue closed, inbound message discarded");
            }
        }
        EventRoute::SubscribeSent(pkid) => tracker.subscribe_sent(pkid),
        EventRoute::PublishSent(pkid) => tracker.publish_sent(pkid),
        EventRoute::SubscriptionAcknowledged { pkid, result } => {
            tracker.subscription_acknowledged(pkid, result)
        }
        EventRoute::PublishAcknowledged { pkid, result } => {
            tracker.publish_acknowledged(pkid, result)
        }
        EventRoute::Disconnected(reason) => return Some(format!("broker disconnected: {reason}")),
        EventRoute::ClosedLocally => return Some("closed locally".to_string()),
        EventRoute::ConnectionAcknowledged { .. } => {
            warn!("Unexpected ConnAck on established session")
        }
        EventRoute::Infrastructure(event) => trace!(event = %event, "MQTT infrastructure event"),
    }
    None
}

fn report_lost(lost: oneshot::Sender<String>, reason: String) {
    error!(reason = %reason, "MQTT session lost");
    if lost.send(reason).is_err() {
        debug!("Nobody listening for session loss");
    }
}

/// An established rumqttc session
pub struct RumqttcSession {
    client: AsyncClient,
    tracker: Arc<Mutex<AckTracker>>,
    /// Held while queuing a waiter and handing the request to the client,
    /// so waiter order matches request order
    writer: tokio::sync::Mutex<()>,
    closing: Arc<AtomicBool>,
    session_present: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

async fn await_ack(rx: AckReceiver) -> Result<(), TransportError> {
    rx.await.unwrap_or(Err(TransportError::Closed))
}

#[async_trait::async_trait]
impl BrokerSession for RumqttcSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let rx = {
            let _writer = self.writer.lock().await;
            let (request, rx) = QueuedRequest::subscribe(&self.tracker, topic, qos);
            self.client
                .subscribe(topic, qos)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            request.handed_over();
            rx
        };
        await_ack(rx).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let rx = {
            let _writer = self.writer.lock().await;
            let (request, rx) = QueuedRequest::publish(&self.tracker, &message.topic, message.qos);
            self.client
                .publish(message.topic.clone(), message.qos, false, message.payload)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            request.handed_over();
            rx
        };
        await_ack(rx).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Release);
        let disconnect = self.client.disconnect().await;

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting it");
                task.abort();
            }
        }

        disconnect.map_err(|e| TransportError::Io(e.to_string()))
    }

    fn session_present(&self) -> bool {
        self.session_present
    }
}

impl Drop for RumqttcSession {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
