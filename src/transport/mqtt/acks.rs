//! Acknowledgement tracking for subscribe and publish requests
//!
//! rumqttc assigns packet ids inside its event loop, so a waiter is queued
//! before the request is handed to the client and bound to its packet id
//! when the matching `Outgoing` event appears. Requests are handed over in
//! the same order their waiters were queued, so the queues are FIFO.

use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type AckResult = Result<(), TransportError>;
pub type AckReceiver = oneshot::Receiver<AckResult>;

#[derive(Debug)]
struct Waiter {
    topic: String,
    qos: QoS,
    respond: oneshot::Sender<AckResult>,
}

impl Waiter {
    fn resolve(self, result: AckResult) {
        // The caller may have timed out and gone away
        let _ = self.respond.send(result);
    }
}

#[derive(Debug, Default)]
pub struct AckTracker {
    queued_subscribes: VecDeque<Waiter>,
    queued_publishes: VecDeque<Waiter>,
    subscribes: HashMap<u16, Waiter>,
    publishes: HashMap<u16, Waiter>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for the next subscribe request
    pub fn expect_subscribe(&mut self, topic: &str, qos: QoS) -> AckReceiver {
        let (respond, rx) = oneshot::channel();
        self.queued_subscribes.push_back(Waiter {
            topic: topic.to_string(),
            qos,
            respond,
        });
        rx
    }

    /// Queue a waiter for the next publish request
    pub fn expect_publish(&mut self, topic: &str, qos: QoS) -> AckReceiver {
        let (respond, rx) = oneshot::channel();
        self.queued_publishes.push_back(Waiter {
            topic: topic.to_string(),
            qos,
            respond,
        });
        rx
    }

    /// Drop the most recently queued subscribe waiter; used when the request
    /// never reached the client
    pub fn withdraw_subscribe(&mut self) {
        self.queued_subscribes.pop_back();
    }

    /// Drop the most recently queued publish waiter
    pub fn withdraw_publish(&mut self) {
        self.queued_publishes.pop_back();
    }

    /// A subscribe request left with `pkid`
    pub fn subscribe_sent(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(waiter) => {
                debug!(topic = %waiter.topic, pkid, "Subscribe sent");
                self.subscribes.insert(pkid, waiter);
            }
            None => warn!(pkid, "Subscribe sent with no waiter queued"),
        }
    }

    /// A publish request left with `pkid`. QoS 0 has nothing further to wait
    /// for and resolves immediately.
    pub fn publish_sent(&mut self, pkid: u16) {
        let Some(waiter) = self.queued_publishes.pop_front() else {
            warn!(pkid, "Publish sent with no waiter queued");
            return;
        };

        if waiter.qos == QoS::AtMostOnce {
            waiter.resolve(Ok(()));
        } else {
            debug!(topic = %waiter.topic, pkid, qos = ?waiter.qos, "Publish sent");
            self.publishes.insert(pkid, waiter);
        }
    }

    pub fn subscription_acknowledged(&mut self, pkid: u16, result: Result<(), String>) {
        match self.subscribes.remove(&pkid) {
            Some(waiter) => {
                let outcome = result.map_err(|reason| TransportError::SubscriptionRejected {
                    topic: waiter.topic.clone(),
                    reason,
                });
                waiter.resolve(outcome);
            }
            None => debug!(pkid, "SubAck for unknown packet id"),
        }
    }

    pub fn publish_acknowledged(&mut self, pkid: u16, result: Result<(), String>) {
        match self.publishes.remove(&pkid) {
            Some(waiter) => {
                let outcome = result.map_err(|reason| TransportError::PublishRejected {
                    topic: waiter.topic.clone(),
                    reason,
                });
                waiter.resolve(outcome);
            }
            None => debug!(pkid, "Publish acknowledgement for unknown packet id"),
        }
    }

    /// Number of requests still waiting for the broker
    pub fn pending(&self) -> usize {
        self.queued_subscribes.len()
            + self.queued_publishes.len()
            + self.subscribes.len()
            + self.publishes.len()
    }

    /// Fail every outstanding waiter; the session is gone
    pub fn fail_all(&mut self) {
        let waiters = self
            .queued_subscribes
            .drain(..)
            .chain(self.queued_publishes.drain(..))
            .chain(self.subscribes.drain().map(|(_, waiter)| waiter))
            .chain(self.publishes.drain().map(|(_, waiter)| waiter));

        for waiter in waiters {
            waiter.resolve(Err(TransportError::Closed));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Subscribe,
    Publish,
}

/// A waiter queued for a request that has not reached the client yet
///
/// Dropping it before [`QueuedRequest::handed_over`] withdraws the waiter,
/// so a caller that is cancelled mid-handover does not leave a waiter behind
/// for the next request's packet id. Must be dropped while the writer lock
/// that serialised the queuing is still held.
#[derive(Debug)]
pub struct QueuedRequest<'a> {
    tracker: &'a Mutex<AckTracker>,
    kind: RequestKind,
    armed: bool,
}

impl<'a> QueuedRequest<'a> {
    pub fn subscribe(
        tracker: &'a Mutex<AckTracker>,
        topic: &str,
        qos: QoS,
    ) -> (Self, AckReceiver) {
        let rx = lock(tracker).expect_subscribe(topic, qos);
        (Self::armed(tracker, RequestKind::Subscribe), rx)
    }

    pub fn publish(tracker: &'a Mutex<AckTracker>, topic: &str, qos: QoS) -> (Self, AckReceiver) {
        let rx = lock(tracker).expect_publish(topic, qos);
        (Self::armed(tracker, RequestKind::Publish), rx)
    }

    fn armed(tracker: &'a Mutex<AckTracker>, kind: RequestKind) -> Self {
        Self {
            tracker,
            kind,
            armed: true,
        }
    }

    /// The client accepted the request; the waiter now belongs to the event loop
    pub fn handed_over(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(kind = ?self.kind, "Withdrawing waiter for request that never reached the client");
        let mut tracker = lock(self.tracker);
        match self.kind {
            RequestKind::Subscribe => tracker.withdraw_subscribe(),
            RequestKind::Publish => tracker.withdraw_publish(),
        }
    }
}

fn lock(tracker: &Mutex<AckTracker>) -> std::sync::MutexGuard<'_, AckTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}
