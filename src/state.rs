//! Connection state machine and its observable cell
//!
//! The transition function is pure; [`StateCell`] applies it under a lock and
//! fans every accepted transition out to observers, so a watcher sees the
//! value current at subscription time followed by every later transition.

use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

const TRANSITION_BUFFER: usize = 32;

/// Broker connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session, or the last one ended
    #[default]
    Disconnected,
    /// Handshake in flight
    Connecting,
    /// Broker acknowledged the session
    Connected,
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `connect` was called
    ConnectRequested,
    /// ConnAck received
    HandshakeSucceeded,
    /// Handshake refused or transport failed before ConnAck
    HandshakeFailed(String),
    /// Established session dropped by broker or network
    ConnectionLost(String),
    /// Session closed locally (explicit disconnect or replacement)
    TornDown,
}

/// Pure transition function; `None` means the event is not valid in the
/// current state
pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent::*;
    use ConnectionState::*;

    match (current, event) {
        (Disconnected, ConnectRequested) => Some(Connecting),
        (Connecting, HandshakeSucceeded) => Some(Connected),
        (Connecting, HandshakeFailed(_)) => Some(Disconnected),
        (Connecting, TornDown) => Some(Disconnected),
        (Connected, ConnectionLost(_)) => Some(Disconnected),
        (Connected, TornDown) => Some(Disconnected),
        _ => None,
    }
}

/// Log a state transition at the appropriate level
pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
    match (from, to, event) {
        (ConnectionState::Connecting, ConnectionState::Connected, _) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected, ConnectionEvent::ConnectionLost(reason)) => {
            warn!(reason = %reason, "MQTT connection lost");
        }
        (ConnectionState::Connecting, ConnectionState::Disconnected, ConnectionEvent::HandshakeFailed(reason)) => {
            warn!(reason = %reason, "MQTT handshake failed");
        }
        _ => {
            info!("MQTT connection state: {:?} -> {:?}", from, to);
        }
    }
}

/// Holds the current [`ConnectionState`] and broadcasts transitions
#[derive(Debug)]
pub struct StateCell {
    current: Mutex<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            current: Mutex::new(ConnectionState::Disconnected),
            transitions,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an event. Returns the new state, or `None` when the event was
    /// rejected and the state left unchanged.
    pub fn apply(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match next_state(*current, &event) {
            Some(next) => {
                log_state_transition(*current, next, &event);
                *current = next;
                // No receivers is fine
                let _ = self.transitions.send(next);
                Some(next)
            }
            None => {
                warn!(
                    state = ?*current,
                    event = ?event,
                    "Ignoring connection event not valid in current state"
                );
                None
            }
        }
    }

    /// Observe the current state and every later transition
    pub fn watch(&self) -> StateWatcher {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        StateWatcher {
            initial: *current,
            rx: self.transitions.subscribe(),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer handle returned by [`StateCell::watch`]
#[derive(Debug)]
pub struct StateWatcher {
    initial: ConnectionState,
    rx: broadcast::Receiver<ConnectionState>,
}

impl StateWatcher {
    /// State at the moment the watcher was created
    pub fn initial(&self) -> ConnectionState {
        self.initial
    }

    /// Next transition; `None` once the owning cell is gone
    pub async fn next(&mut self) -> Option<ConnectionState> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("State watcher lagged, skipped {} transitions", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant of [`StateWatcher::next`] for non-async callers
    pub fn blocking_next(&mut self) -> Option<ConnectionState> {
        loop {
            match self.rx.blocking_recv() {
                Ok(state) => return Some(state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("State watcher lagged, skipped {} transitions", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next transition if one is already queued
    pub fn try_next(&mut self) -> Option<ConnectionState> {
        loop {
            match self.rx.try_recv() {
                Ok(state) => return Some(state),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
