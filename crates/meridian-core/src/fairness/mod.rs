pub mod estimator;
pub mod fair_queue;
pub mod flow;
pub mod forwarder;
pub mod object;
pub mod pacer;
pub mod receive;
pub mod send;
pub mod stats;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{EstimatorConfig, PacingConfig};
use crate::error::PushError;
use crate::message::ServerMessage;

pub use estimator::CapacityEstimator;
pub use fair_queue::{EmptyQueuePolicy, FairQueue, FairQueueOptions, PopOutcome};
pub use flow::{BoundedQueue, FlowQueue, PushQueue};
pub use forwarder::{ForwarderServiceQueue, ServiceQueueListener};
pub use object::{
    object_queue_from_config, DirectoryLocator, FairObjectMessageQueue, FifoObjectMessageQueue,
    ObjectLocator, ObjectMessageQueue, ObjectMessageRouter, SendFailurePolicy,
    ServerRoutingAdapter,
};
pub use pacer::{BytePacer, PassEnd};
pub use receive::{FairServerMessageReceiver, ReceiveQueue, ServerMessageReceiver};
pub use send::{FairServerMessageQueue, ServerMessageQueue, ServerMessageSource, SourceQueue};
pub use stats::QueueInfo;

/// How a service pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Every flow is empty.
    Drained,
    /// Data remains but the budget ran out. `retry_after` is when enough
    /// bytes will have accrued for the blocking message, `None` when the
    /// rate is zero and only an external trigger can help.
    Blocked { retry_after: Option<Duration> },
    /// The next stage refused a message; it stays queued.
    Stalled,
    /// Another pass was already running; this trigger was dropped.
    Busy,
}

/// Anything that accepts server messages for delivery: the forwarder's
/// service queues or a send queue that owns its storage.
pub trait ServerMessageSink: Send + Sync {
    fn can_accept(&self, message: &ServerMessage) -> bool;

    fn accept(&self, message: ServerMessage) -> Result<(), PushError<ServerMessage>>;
}

/// State guarded by a queue direction's service mutex.
pub(crate) struct PassState {
    pub pacer: BytePacer,
    pub estimator: CapacityEstimator,
}

impl PassState {
    pub fn new(pacing: &PacingConfig, estimator: &EstimatorConfig) -> Self {
        Self {
            pacer: BytePacer::new(pacing.rate_bytes_per_sec),
            estimator: CapacityEstimator::new(
                pacing.rate_bytes_per_sec,
                estimator.window(),
                estimator.optimism_factor,
            ),
        }
    }
}

/// Why a pass stopped, before pacing is settled.
pub(crate) enum Stop {
    Drained,
    Blocked { needed: usize },
    Stalled,
}

/// Upstream flow-control signals, readable without the service mutex.
pub(crate) struct FlowControl {
    capacity_bits: AtomicU64,
    blocked: AtomicBool,
}

impl FlowControl {
    pub fn new(initial_rate: f64) -> Self {
        Self {
            capacity_bits: AtomicU64::new(initial_rate.to_bits()),
            blocked: AtomicBool::new(false),
        }
    }

    pub fn capacity_estimate(&self) -> f64 {
        f64::from_bits(self.capacity_bits.load(Ordering::Relaxed))
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Settle the pacer and estimator after a pass that charged `spent`
    /// bytes, publish the new signals and produce the outcome.
    pub fn close_pass(
        &self,
        state: &mut PassState,
        spent: usize,
        now: Instant,
        stop: Stop,
        min_retry: Duration,
    ) -> ServiceOutcome {
        let (end, blocked) = match stop {
            Stop::Drained => (PassEnd::Drained, false),
            Stop::Blocked { .. } => (PassEnd::OutOfBudget, true),
            Stop::Stalled => (PassEnd::Stalled, true),
        };
        state.pacer.finish(spent, now, end);
        state.estimator.record(spent, now);
        self.capacity_bits
            .store(state.estimator.estimate(blocked).to_bits(), Ordering::Relaxed);
        self.blocked.store(blocked, Ordering::Relaxed);

        match stop {
            Stop::Drained => ServiceOutcome::Drained,
            Stop::Stalled => ServiceOutcome::Stalled,
            Stop::Blocked { needed } => ServiceOutcome::Blocked {
                retry_after: state.pacer.time_until(needed).map(|d| d.max(min_retry)),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use crate::message::{ServerId, ServerMessage};
    use crate::network::{Network, ServerMessageListener};

    /// Network that records what it accepts and can be told to refuse.
    #[derive(Default)]
    pub struct RecordingNetwork {
        pub sent: Mutex<Vec<ServerMessage>>,
        pub connects: Mutex<Vec<ServerId>>,
        refuse: AtomicBool,
        down: Mutex<BTreeSet<ServerId>>,
    }

    impl RecordingNetwork {
        pub fn refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        /// Refuse sends to `peer` only.
        pub fn peer_down(&self, peer: ServerId) {
            self.down.lock().insert(peer);
        }

        pub fn sent_to(&self, peer: ServerId) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter(|m| m.destination() == peer)
                .map(|m| m.id)
                .collect()
        }

        pub fn sent_ids(&self) -> Vec<u64> {
            self.sent.lock().iter().map(|m| m.id).collect()
        }

        pub fn sent_bytes(&self) -> usize {
            use crate::message::QueueMessage;
            self.sent.lock().iter().map(|m| m.size()).sum()
        }
    }

    impl Network for RecordingNetwork {
        fn try_send(&self, destination: ServerId, bytes: &[u8]) -> bool {
            if self.refuse.load(Ordering::SeqCst) || self.down.lock().contains(&destination) {
                return false;
            }
            let message = ServerMessage::decode(bytes).expect("decodable");
            self.sent.lock().push(message);
            true
        }

        fn connect(&self, destination: ServerId) -> bool {
            self.connects.lock().push(destination);
            !self.down.lock().contains(&destination)
        }
    }

    /// Listener that keeps every delivered message.
    #[derive(Default)]
    pub struct CollectingListener {
        pub received: Mutex<Vec<ServerMessage>>,
    }

    impl CollectingListener {
        pub fn ids(&self) -> Vec<u64> {
            self.received.lock().iter().map(|m| m.id).collect()
        }
    }

    impl ServerMessageListener for CollectingListener {
        fn server_message_received(&self, message: ServerMessage) {
            self.received.lock().push(message);
        }
    }
}
