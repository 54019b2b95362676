use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::message::{ObjectId, QueueMessage, ServerMessage};
use crate::metrics::Metrics;

/// Per-message observation hook. Every method defaults to a no-op so
/// implementations pick the events they care about.
pub trait MessageTrace: Send + Sync {
    /// A server message left through the network. `start` and `end` come
    /// from the send queue's synthetic clock.
    fn server_message_sent(&self, _message: &ServerMessage, _start: Instant, _end: Instant) {}

    /// A server message was handed to the local listener.
    fn server_message_received(&self, _message: &ServerMessage, _at: Instant) {}

    /// An object message was accepted by its router. The message itself now
    /// belongs to the router, so only its identity and size are passed.
    fn object_message_routed(
        &self,
        _object: ObjectId,
        _id: u64,
        _bytes: usize,
        _start: Instant,
        _end: Instant,
    ) {
    }
}

/// Discards everything.
pub struct NoTrace;

impl MessageTrace for NoTrace {}

/// Emits each event at `trace` level.
pub struct LogTrace;

impl MessageTrace for LogTrace {
    fn server_message_sent(&self, message: &ServerMessage, start: Instant, end: Instant) {
        trace!(
            id = message.id,
            peer = %message.destination,
            service = %message.service,
            bytes = message.size(),
            duration_us = end.saturating_duration_since(start).as_micros() as u64,
            "server message sent"
        );
    }

    fn server_message_received(&self, message: &ServerMessage, _at: Instant) {
        trace!(
            id = message.id,
            peer = %message.source,
            service = %message.service,
            bytes = message.size(),
            "server message received"
        );
    }

    fn object_message_routed(
        &self,
        object: ObjectId,
        id: u64,
        bytes: usize,
        start: Instant,
        end: Instant,
    ) {
        trace!(
            id,
            %object,
            bytes,
            duration_us = end.saturating_duration_since(start).as_micros() as u64,
            "object message routed"
        );
    }
}

/// Observability handles shared by the queues of one server.
#[derive(Clone)]
pub struct Hooks {
    pub trace: Arc<dyn MessageTrace>,
    pub metrics: Arc<Metrics>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            trace: Arc::new(NoTrace),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl Hooks {
    pub fn with_trace(mut self, trace: Arc<dyn MessageTrace>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}
