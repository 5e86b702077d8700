//! Inbound message fan-out
//!
//! The dispatcher is the only consumer of the session's inbound queue. It
//! runs on its own thread, so a handler may call back into the blocking
//! service API without stalling the I/O runtime. Every handler is invoked in
//! isolation: a decode error, handler error or panic is logged and counted,
//! and the next handler still runs.

use crate::error::{sanitize_error_message, DispatchError, HandlerError};
use crate::protocol::codec::peek_type_tag;
use crate::registry::HandlerRegistry;
use crate::transport::{InboundMessage, InboundSink};
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Name of the thread running handlers
pub const DISPATCH_THREAD_NAME: &str = "mqtt-dispatch";

/// Counters kept by the dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Messages with no handler for their topic
    pub dropped: u64,
    pub decode_failures: u64,
    /// Handler errors and panics
    pub handler_failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Result of dispatching one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Hand `message` to every active handler registered for its topic
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let entries = self.registry.lookup(&message.topic);
        if entries.is_empty() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(topic = %message.topic, "No handler for topic, dropping message");
            return DispatchOutcome::default();
        }

        let _span = crate::dispatch_span!(topic = %message.topic).entered();
        debug!(
            handlers = entries.len(),
            bytes = message.payload.len(),
            "Dispatching message"
        );

        let mut outcome = DispatchOutcome::default();
        for entry in entries {
            if !entry.is_active() {
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| entry.dispatch(&message.payload)))
                .unwrap_or_else(|panic| {
                    Err(DispatchError::Handler(HandlerError::Panicked(
                        panic_message(panic.as_ref()),
                    )))
                });

            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(DispatchError::Decode { message_type, source }) => {
                    outcome.failed += 1;
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %message.topic,
                        handler_id = %entry.id(),
                        message_type,
                        found_type = ?peek_type_tag(&message.payload).ok(),
                        error = %source,
                        "Failed to decode message for handler"
                    );
                }
                Err(DispatchError::Handler(handler_error)) => {
                    outcome.failed += 1;
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        topic = %message.topic,
                        handler_id = %entry.id(),
                        message_type = entry.message_type(),
                        error = %sanitize_error_message(&handler_error.to_string()),
                        "Handler failed"
                    );
                }
            }
        }

        outcome
    }

    /// Start the dispatch thread and return the sink that feeds it
    pub fn spawn(self) -> std::io::Result<(InboundSink, DispatcherHandle)> {
        let (sink, rx) = InboundSink::channel();
        let stats = self.stats.clone();
        let thread = std::thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || self.run(rx))?;

        Ok((
            sink,
            DispatcherHandle {
                thread: Some(thread),
                stats,
            },
        ))
    }

    fn run(self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        info!("Dispatcher started");
        while let Some(message) = rx.blocking_recv() {
            self.dispatch(&message);
        }
        info!("Dispatcher stopped, inbound queue closed");
    }
}

/// Owner of the dispatch thread
#[derive(Debug)]
pub struct DispatcherHandle {
    thread: Option<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the thread to exit. It exits once every [`InboundSink`]
    /// clone has been dropped.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
