//! Topic-keyed registry of type-erased message handlers
//!
//! Each entry captures its own decode step, so handlers for different message
//! types can share a topic. Entries are appended in registration order and
//! removed by identity; callers only ever hold a [`HandlerHandle`].
//!
//! Handlers on a topic share one [`TopicSubscription`]. The first
//! registrant subscribes at the broker and settles it; registrants that
//! arrive while it is pending wait for the outcome, and a failed subscribe
//! removes all of them together.

use crate::error::{DispatchError, HandlerResult};
use crate::protocol::codec::decode;
use crate::protocol::messages::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

type ErasedHandler = Box<dyn Fn(&[u8]) -> Result<(), DispatchError> + Send + Sync>;

/// One registered handler
pub struct HandlerEntry {
    id: Uuid,
    topic: String,
    message_type: &'static str,
    active: AtomicBool,
    invoke: ErasedHandler,
}

impl HandlerEntry {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Type tag of the message this handler expects
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// False once the entry has been cancelled
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Decode `payload` as this entry's message type and run the handler
    pub fn dispatch(&self, payload: &[u8]) -> Result<(), DispatchError> {
        (self.invoke)(payload)
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("message_type", &self.message_type)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Identity of one registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    id: Uuid,
    topic: String,
}

impl HandlerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Outcome of the broker subscribe shared by the handlers of one topic
#[derive(Debug, Default)]
pub struct TopicSubscription {
    outcome: Mutex<Option<Result<(), String>>>,
    settled: Condvar,
}

impl TopicSubscription {
    fn settle(&self, outcome: Result<(), String>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.settled.notify_all();
    }

    /// Block until the subscribe has been acknowledged or has failed
    pub fn wait(&self) -> Result<(), String> {
        let outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = self
            .settled
            .wait_while(outcome, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        outcome.clone().unwrap_or(Ok(()))
    }

    pub fn is_settled(&self) -> bool {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Result of [`HandlerRegistry::register`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub handle: HandlerHandle,
    /// No other handler was registered for the topic, so this registrant
    /// must subscribe and then call [`HandlerRegistry::subscription_settled`]
    pub first_for_topic: bool,
    /// Shared with every handler registered on the topic before it empties
    pub subscription: Arc<TopicSubscription>,
}

#[derive(Debug, Default)]
struct TopicHandlers {
    entries: Vec<Arc<HandlerEntry>>,
    subscription: Arc<TopicSubscription>,
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    topics: Mutex<HashMap<String, TopicHandlers>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicHandlers>> {
        // A panicking handler never runs under this lock, poisoning can only
        // come from a bug in the registry itself
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a handler for messages of type `M` on `topic`
    pub fn register<M, F>(&self, topic: &str, handler: F) -> Registration
    where
        M: Message,
        F: Fn(M) -> HandlerResult + Send + Sync + 'static,
    {
        let invoke: ErasedHandler = Box::new(move |payload: &[u8]| {
            let message = decode::<M>(payload).map_err(|source| DispatchError::Decode {
                message_type: M::TYPE_TAG,
                source,
            })?;
            trace!(
                message_type = M::TYPE_TAG,
                source = %message.header().source,
                "Decoded message"
            );
            handler(message).map_err(DispatchError::from)
        });

        let entry = Arc::new(HandlerEntry {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            message_type: M::TYPE_TAG,
            active: AtomicBool::new(true),
            invoke,
        });
        let handle = HandlerHandle {
            id: entry.id,
            topic: entry.topic.clone(),
        };

        let mut topics = self.lock();
        let handlers = topics.entry(topic.to_string()).or_default();
        let first_for_topic = handlers.entries.is_empty();
        handlers.entries.push(entry);

        debug!(
            topic = %topic,
            message_type = M::TYPE_TAG,
            handler_id = %handle.id,
            handlers = handlers.entries.len(),
            "Registered handler"
        );

        Registration {
            handle,
            first_for_topic,
            subscription: handlers.subscription.clone(),
        }
    }

    /// Record the outcome of the subscribe made for `registration`'s topic
    /// and wake registrants waiting on it. On failure every handler that
    /// joined the pending subscription is removed.
    pub fn subscription_settled(&self, registration: &Registration, outcome: Result<(), String>) {
        if outcome.is_err() {
            let topic = registration.handle.topic();
            let mut topics = self.lock();
            let same_subscription = topics.get(topic).is_some_and(|handlers| {
                Arc::ptr_eq(&handlers.subscription, &registration.subscription)
            });
            if same_subscription {
                if let Some(handlers) = topics.remove(topic) {
                    for entry in &handlers.entries {
                        entry.active.store(false, Ordering::Release);
                    }
                    debug!(
                        topic = %topic,
                        removed = handlers.entries.len(),
                        "Removed handlers after failed subscribe"
                    );
                }
            }
        }
        registration.subscription.settle(outcome);
    }

    /// True when a registration on `topic` would be the first one
    pub fn subscription_needed(&self, topic: &str) -> bool {
        self.lock()
            .get(topic)
            .map_or(true, |handlers| handlers.entries.is_empty())
    }

    /// Remove the entry behind `handle`. Returns false if it was already gone.
    pub fn cancel(&self, handle: &HandlerHandle) -> bool {
        let mut topics = self.lock();
        let Some(handlers) = topics.get_mut(&handle.topic) else {
            return false;
        };
        let Some(position) = handlers
            .entries
            .iter()
            .position(|entry| entry.id == handle.id)
        else {
            return false;
        };

        let entry = handlers.entries.remove(position);
        // Snapshots taken before the removal skip the entry from now on
        entry.active.store(false, Ordering::Release);
        if handlers.entries.is_empty() {
            topics.remove(&handle.topic);
        }

        debug!(topic = %handle.topic, handler_id = %handle.id, "Cancelled handler");
        true
    }

    /// Snapshot of the handlers for `topic`, in registration order
    pub fn lookup(&self, topic: &str) -> Vec<Arc<HandlerEntry>> {
        self.lock()
            .get(topic)
            .map(|handlers| handlers.entries.clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map_or(0, |handlers| handlers.entries.len())
    }

    /// Topics that currently have at least one handler
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::protocol::codec::encode;
    use crate::protocol::messages::{Accessories, Device, Devices, MessageHeader};
    use std::sync::atomic::AtomicUsize;

    const TOPIC: &str = "controller/ABC/devices";

    fn devices_payload(ids: &[&str]) -> Vec<u8> {
        encode(&Devices {
            header: MessageHeader::new("coordinator"),
            devices: ids.iter().map(|id| Device::new(*id)).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_first_registration_needs_subscription() {
        let registry = HandlerRegistry::new();
        assert!(registry.subscription_needed(TOPIC));

        let first = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        assert!(first.first_for_topic);
        assert!(!registry.subscription_needed(TOPIC));

        let second = registry.register::<Accessories, _>(TOPIC, |_| Ok(()));
        assert!(!second.first_for_topic);
        assert_eq!(registry.handler_count(TOPIC), 2);
    }

    #[test]
    fn test_lookup_preserves_registration_order() {
        let registry = HandlerRegistry::new();
        let a = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        let b = registry.register::<Accessories, _>(TOPIC, |_| Ok(()));
        let c = registry.register::<Devices, _>(TOPIC, |_| Ok(()));

        let ids: Vec<Uuid> = registry.lookup(TOPIC).iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![a.handle.id(), b.handle.id(), c.handle.id()]);
    }

    #[test]
    fn test_lookup_unknown_topic_is_empty() {
        let registry = HandlerRegistry::new();
        registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        assert!(registry.lookup("controller/ABC").is_empty());
        assert!(registry.lookup("controller/ABC/devices/").is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let registry = HandlerRegistry::new();
        let keep = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        let removed = registry.register::<Devices, _>(TOPIC, |_| Ok(()));

        assert!(registry.cancel(&removed.handle));
        assert!(!registry.cancel(&removed.handle));

        let remaining = registry.lookup(TOPIC);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), keep.handle.id());
    }

    #[test]
    fn test_cancel_last_handler_frees_topic() {
        let registry = HandlerRegistry::new();
        let registration = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        assert_eq!(registry.topics(), vec![TOPIC.to_string()]);

        registry.cancel(&registration.handle);
        assert!(registry.topics().is_empty());
        assert!(registry.subscription_needed(TOPIC));
    }

    #[test]
    fn test_cancel_deactivates_snapshot_entries() {
        let registry = HandlerRegistry::new();
        let registration = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        let snapshot = registry.lookup(TOPIC);

        registry.cancel(&registration.handle);
        assert!(!snapshot[0].is_active());
    }

    #[test]
    fn test_entry_decodes_for_handler() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.register::<Devices, _>(TOPIC, move |devices| {
            sink.lock()
                .unwrap()
                .extend(devices.devices.into_iter().map(|d| d.id));
            Ok(())
        });

        let entry = &registry.lookup(TOPIC)[0];
        assert_eq!(entry.message_type(), "picontrol.Devices");
        entry.dispatch(&devices_payload(&["d1", "d2"])).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["d1", "d2"]);
    }

    #[test]
    fn test_entry_reports_decode_and_handler_errors() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register::<Accessories, _>(TOPIC, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register::<Devices, _>(TOPIC, |_| Err(HandlerError::from("no devices")));

        let entries = registry.lookup(TOPIC);
        let payload = devices_payload(&["d1"]);
        assert!(matches!(
            entries[0].dispatch(&payload),
            Err(DispatchError::Decode { message_type: "picontrol.Accessories", .. })
        ));
        assert!(matches!(
            entries[1].dispatch(&payload),
            Err(DispatchError::Handler(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_registration_has_single_first() {
        let registry = Arc::new(HandlerRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .register::<Devices, _>(TOPIC, |_| Ok(()))
                        .first_for_topic
                })
            })
            .collect();

        let firsts = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);
        assert_eq!(registry.handler_count(TOPIC), 8);
    }

    #[test]
    fn test_failed_subscription_removes_waiting_registrants() {
        let registry = HandlerRegistry::new();
        let first = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        let joined = registry.register::<Accessories, _>(TOPIC, |_| Ok(()));
        assert!(!joined.first_for_topic);
        assert!(!joined.subscription.is_settled());

        let waiter = {
            let subscription = joined.subscription.clone();
            std::thread::spawn(move || subscription.wait())
        };
        let snapshot = registry.lookup(TOPIC);

        registry.subscription_settled(&first, Err("NotAuthorized".to_string()));

        assert_eq!(waiter.join().unwrap(), Err("NotAuthorized".to_string()));
        assert_eq!(registry.handler_count(TOPIC), 0);
        assert!(snapshot.iter().all(|entry| !entry.is_active()));
        assert!(!registry.cancel(&joined.handle));
        assert!(registry.subscription_needed(TOPIC));
    }

    #[test]
    fn test_settled_subscription_admits_later_registrants() {
        let registry = HandlerRegistry::new();
        let first = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        registry.subscription_settled(&first, Ok(()));

        let later = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        assert!(!later.first_for_topic);
        assert_eq!(later.subscription.wait(), Ok(()));
        assert_eq!(registry.handler_count(TOPIC), 2);
    }

    #[test]
    fn test_stale_failure_leaves_new_subscription_alone() {
        let registry = HandlerRegistry::new();
        let abandoned = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        registry.cancel(&abandoned.handle);

        let fresh = registry.register::<Devices, _>(TOPIC, |_| Ok(()));
        assert!(fresh.first_for_topic);

        registry.subscription_settled(&abandoned, Err("timed out".to_string()));
        assert_eq!(registry.handler_count(TOPIC), 1);
        assert!(!fresh.subscription.is_settled());
    }
}
