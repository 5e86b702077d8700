//! In-memory MQTT broker for testing
//!
//! [`MockBroker`] implements [`BrokerTransport`] without a network. It keeps
//! persistent sessions per client id, checks credentials, can reject
//! subscriptions or publishes per topic, can slow down subscription
//! acknowledgements, can hold handshakes open, loops
//! publishes back to subscribed sessions and can drop every connection.

use crate::protocol::codec::encode;
use crate::protocol::messages::Message;
use crate::transport::{
    BrokerCredentials, BrokerSession, BrokerTransport, InboundMessage, InboundSink,
    OutboundMessage, SessionContext, SessionOptions, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct LiveSession {
    client_id: String,
    subscriptions: HashSet<String>,
    inbound: InboundSink,
    lost: Option<oneshot::Sender<String>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    required_credentials: Mutex<Option<BrokerCredentials>>,
    rejected_subscriptions: Mutex<HashSet<String>>,
    rejected_publishes: Mutex<HashSet<String>>,
    subscribe_delay: Mutex<Option<Duration>>,
    handshake_gate: Mutex<Option<Arc<Semaphore>>>,
    live: Mutex<HashMap<u64, LiveSession>>,
    /// Subscriptions kept for clients that connected with clean_start=false
    stored_sessions: Mutex<HashMap<String, HashSet<String>>>,
    subscribe_calls: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<OutboundMessage>>,
    connect_attempts: AtomicU64,
    next_session_id: AtomicU64,
}

/// Shared handle to an in-memory broker; clones see the same broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections that do not present exactly these credentials
    pub fn require_credentials(self, username: &str, password: &str) -> Self {
        *lock(&self.state.required_credentials) = Some(BrokerCredentials::new(username, password));
        self
    }

    /// Answer subscriptions to `topic` with a failure reason code
    pub fn reject_subscription(self, topic: &str) -> Self {
        lock(&self.state.rejected_subscriptions).insert(topic.to_string());
        self
    }

    /// Answer publishes to `topic` with a failure reason code
    pub fn reject_publish(self, topic: &str) -> Self {
        lock(&self.state.rejected_publishes).insert(topic.to_string());
        self
    }

    /// Wait `delay` before answering each subscription
    pub fn delay_subscriptions(self, delay: Duration) -> Self {
        *lock(&self.state.subscribe_delay) = Some(delay);
        self
    }

    /// Hold every handshake until [`MockBroker::release_handshakes`]
    pub fn stall_handshakes(self) -> Self {
        *lock(&self.state.handshake_gate) = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `count` stalled handshakes complete
    pub fn release_handshakes(&self, count: usize) {
        if let Some(gate) = lock(&self.state.handshake_gate).as_ref() {
            gate.add_permits(count);
        }
    }

    /// Deliver a raw payload to every live session subscribed to `topic`.
    /// Returns the number of sessions it reached.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QoS::ExactlyOnce,
            retain: false,
        };
        self.route(message)
    }

    /// Encode `message` and inject it on `topic`
    pub fn inject_message<M: Message>(&self, topic: &str, message: &M) -> usize {
        match encode(message) {
            Ok(payload) => self.inject(topic, payload),
            Err(_) => 0,
        }
    }

    /// Kill every live session as if the network went away
    pub fn drop_connection(&self, reason: &str) {
        let sessions: Vec<LiveSession> = lock(&self.state.live).drain().map(|(_, s)| s).collect();
        for mut session in sessions {
            if let Some(lost) = session.lost.take() {
                let _ = lost.send(reason.to_string());
            }
        }
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.state.live).len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// How many SUBSCRIBE packets were received for `topic`
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        lock(&self.state.subscribe_calls)
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Every accepted publish, in arrival order
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.state.published).clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    fn route(&self, message: InboundMessage) -> usize {
        let live = lock(&self.state.live);
        live.values()
            .filter(|session| session.subscriptions.contains(&message.topic))
            .filter(|session| session.inbound.deliver(message.clone()))
            .count()
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn open(
        &self,
        options: SessionOptions,
        context: SessionContext,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let gate = lock(&self.state.handshake_gate).clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::Io("broker shut down".to_string()))?
                .forget();
        }

        let required = lock(&self.state.required_credentials).clone();
        if let Some(required) = required {
            if options.credentials.as_ref() != Some(&required) {
                return Err(TransportError::Refused("NotAuthorized".to_string()));
            }
        }

        let (session_present, subscriptions) = {
            let mut stored = lock(&self.state.stored_sessions);
            if options.clean_start {
                stored.remove(&options.client_id);
                (false, HashSet::new())
            } else {
                match stored.get(&options.client_id) {
                    Some(subscriptions) => (true, subscriptions.clone()),
                    None => {
                        stored.insert(options.client_id.clone(), HashSet::new());
                        (false, HashSet::new())
                    }
                }
            }
        };

        let id = self.state.next_session_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.live).insert(
            id,
            LiveSession {
                client_id: options.client_id.clone(),
                subscriptions,
                inbound: context.inbound,
                lost: Some(context.lost),
            },
        );

        Ok(Box::new(MockSession {
            broker: self.clone(),
            id,
            session_present,
        }))
    }
}

#[derive(Debug)]
struct MockSession {
    broker: MockBroker,
    id: u64,
    session_present: bool,
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let state = &self.broker.state;
        *lock(&state.subscribe_calls)
            .entry(topic.to_string())
            .or_default() += 1;

        let delay = *lock(&state.subscribe_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&state.rejected_subscriptions).contains(topic) {
            return Err(TransportError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "NotAuthorized".to_string(),
            });
        }

        let mut live = lock(&state.live);
        let session = live.get_mut(&self.id).ok_or(TransportError::Closed)?;
        session.subscriptions.insert(topic.to_string());
        if let Some(stored) = lock(&state.stored_sessions).get_mut(&session.client_id) {
            stored.insert(topic.to_string());
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let state = &self.broker.state;
        if !lock(&state.live).contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        if lock(&state.rejected_publishes).contains(&message.topic) {
            return Err(TransportError::PublishRejected {
                topic: message.topic,
                reason: "NotAuthorized".to_string(),
            });
        }

        lock(&state.published).push(message.clone());
        self.broker.route(InboundMessage {
            topic: message.topic,
            payload: message.payload,
            qos: message.qos,
            retain: false,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.broker.state.live).remove(&self.id);
        Ok(())
    }

    fn session_present(&self) -> bool {
        self.session_present
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn context() -> (
        SessionContext,
        tokio::sync::mpsc::UnboundedReceiver<InboundMessage>,
        oneshot::Receiver<String>,
    ) {
        let (inbound, rx) = InboundSink::channel();
        let (lost, lost_rx) = oneshot::channel();
        (SessionContext { inbound, lost }, rx, lost_rx)
    }

    #[tokio::test]
    async fn test_publish_loops_back_to_subscribers() {
        let broker = MockBroker::new();
        let (ctx, mut rx, _lost) = context();
        let session = broker
            .open(SessionOptions::new("localhost", 1883, "ABC"), ctx)
            .await
            .unwrap();

        session.subscribe("a/b", QoS::ExactlyOnce).await.unwrap();
        session
            .publish(OutboundMessage::new("a/b", b"hi".to_vec(), QoS::ExactlyOnce))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "a/b");
        assert_eq!(received.payload, Bytes::from_static(b"hi"));
        assert_eq!(broker.published_to("a/b").len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_session_is_resumed() {
        let broker = MockBroker::new();
        let (ctx, _rx, _lost) = context();
        let first = broker
            .open(SessionOptions::new("localhost", 1883, "ABC"), ctx)
            .await
            .unwrap();
        assert!(!first.session_present());
        first.subscribe("a/b", QoS::ExactlyOnce).await.unwrap();
        first.close().await.unwrap();

        let (ctx, mut rx, _lost) = context();
        let second = broker
            .open(SessionOptions::new("localhost", 1883, "ABC"), ctx)
            .await
            .unwrap();
        assert!(second.session_present());
        assert_eq!(broker.inject("a/b", "x"), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_receives_nothing() {
        let broker = MockBroker::new();
        let (ctx, mut rx, _lost) = context();
        let session = broker
            .open(SessionOptions::new("localhost", 1883, "ABC"), ctx)
            .await
            .unwrap();
        session.subscribe("a/b", QoS::ExactlyOnce).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(broker.inject("a/b", "x"), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn test_drop_connection_reports_reason() {
        let broker = MockBroker::new();
        let (ctx, _rx, lost) = context();
        let _session = broker
            .open(SessionOptions::new("localhost", 1883, "ABC"), ctx)
            .await
            .unwrap();

        broker.drop_connection("cable pulled");
        assert_eq!(lost.await.unwrap(), "cable pulled");
        assert_eq!(broker.open_sessions(), 0);
    }
}
