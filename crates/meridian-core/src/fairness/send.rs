use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{EstimatorConfig, PacingConfig};
use crate::error::{FlowResult, PushError};
use crate::fairness::fair_queue::{FairQueue, PopOutcome};
use crate::fairness::flow::{BoundedQueue, FlowQueue, PushQueue};
use crate::fairness::stats::QueueInfo;
use crate::fairness::{FlowControl, PassState, ServerMessageSink, ServiceOutcome, Stop};
use crate::message::{QueueMessage, ServerId, ServerMessage};
use crate::network::{Network, ServerMessageListener};
use crate::trace::Hooks;

/// Outbound server-to-server queue, paced to the link rate and shared
/// fairly across destination servers.
pub trait ServerMessageQueue: Send + Sync {
    /// Run one paced pass at `now`.
    fn service(&self, now: Instant) -> ServiceOutcome;

    /// Edge-triggered wake-up: messages for `destination` became available
    /// in upstream storage.
    fn message_ready(&self, destination: ServerId);

    fn set_server_weight(&self, server: ServerId, weight: f64) -> FlowResult<()>;

    /// Tear down a destination after a segmentation change.
    fn remove_server(&self, server: ServerId) -> bool;

    fn queue_info(&self) -> Vec<QueueInfo<ServerId>>;

    /// Estimated drain rate in bytes per second.
    fn capacity_estimate(&self) -> f64;

    fn is_blocked(&self) -> bool;
}

/// Upstream storage a send queue can pull from instead of owning messages.
pub trait ServerMessageSource: Send + Sync {
    fn front_size(&self, destination: ServerId) -> Option<usize>;

    fn pull(&self, destination: ServerId) -> Option<ServerMessage>;

    /// Put back a message the network refused.
    fn restore(&self, destination: ServerId, message: ServerMessage);

    fn queued_bytes(&self, destination: ServerId) -> usize;

    fn queued_messages(&self, destination: ServerId) -> usize;
}

/// Flow storage backed by a [`ServerMessageSource`].
pub struct SourceQueue {
    source: Arc<dyn ServerMessageSource>,
    destination: ServerId,
}

impl SourceQueue {
    pub fn new(source: Arc<dyn ServerMessageSource>, destination: ServerId) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl FlowQueue for SourceQueue {
    type Item = ServerMessage;

    fn head_size(&self) -> Option<usize> {
        self.source.front_size(self.destination)
    }

    fn pop(&mut self) -> Option<ServerMessage> {
        self.source.pull(self.destination)
    }

    fn restore(&mut self, item: ServerMessage) {
        self.source.restore(self.destination, item);
    }

    fn len(&self) -> usize {
        self.source.queued_messages(self.destination)
    }

    fn queued_bytes(&self) -> usize {
        self.source.queued_bytes(self.destination)
    }

    fn capacity_bytes(&self) -> Option<usize> {
        None
    }
}

type QueueFactory<Q> = Box<dyn Fn(ServerId) -> Q + Send + Sync>;

/// Weighted fair send queue over destination servers.
///
/// Two locks: `data` guards the fair queue and is held per message so
/// producers and weight updates interleave with a running pass; `pass`
/// guards pacing and is only ever try-locked, so overlapping service
/// triggers collapse into one.
pub struct FairServerMessageQueue<Q: FlowQueue<Item = ServerMessage>> {
    local: ServerId,
    data: Mutex<FairQueue<ServerId, Q>>,
    pass: Mutex<PassState>,
    flow: FlowControl,
    network: Arc<dyn Network>,
    listener: Arc<dyn ServerMessageListener>,
    hooks: Hooks,
    make_queue: QueueFactory<Q>,
    /// Drains messages for the local server in pull mode.
    local_source: Option<Arc<dyn ServerMessageSource>>,
    default_weight: f64,
    max_message_bytes: usize,
    min_retry: Duration,
}

impl FairServerMessageQueue<BoundedQueue<ServerMessage>> {
    /// A send queue that owns one bounded sub-queue per destination.
    pub fn new(
        local: ServerId,
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        network: Arc<dyn Network>,
        listener: Arc<dyn ServerMessageListener>,
        hooks: Hooks,
    ) -> Self {
        let capacity = pacing.queue_capacity_bytes;
        Self::build(
            local,
            pacing,
            estimator,
            network,
            listener,
            hooks,
            Box::new(move |_| BoundedQueue::new(capacity)),
            None,
        )
    }

    /// Queue a message for its destination. Messages for this server skip
    /// the queue and go straight to the local listener without using budget.
    pub fn add_message(&self, message: ServerMessage) -> Result<(), PushError<ServerMessage>> {
        let destination = message.destination();
        if destination == self.local {
            self.deliver_local(message);
            return Ok(());
        }

        let mut data = self.data.lock();
        if !data.contains(&destination) {
            if let Err(e) = self.register_destination(&mut data, destination, self.default_weight) {
                warn!(peer = %destination, error = %e, "failed to register destination");
                return Err(PushError::UnknownFlow(message));
            }
        }
        data.push(&destination, message).inspect_err(|_| {
            debug!(peer = %destination, "send queue rejected message");
            self.hooks
                .metrics
                .record_rejected("send", &destination.to_string());
        })
    }

    /// Whether `add_message` of a `size`-byte message would succeed.
    pub fn can_add_message(&self, destination: ServerId, size: usize) -> bool {
        if destination == self.local {
            return true;
        }
        let data = self.data.lock();
        if data.contains(&destination) {
            data.can_push(&destination, size)
        } else {
            size <= self.max_message_bytes && (self.make_queue)(destination).can_push(size)
        }
    }
}

impl ServerMessageSink for FairServerMessageQueue<BoundedQueue<ServerMessage>> {
    fn can_accept(&self, message: &ServerMessage) -> bool {
        self.can_add_message(message.destination(), message.size())
    }

    fn accept(&self, message: ServerMessage) -> Result<(), PushError<ServerMessage>> {
        self.add_message(message)
    }
}

impl FairServerMessageQueue<SourceQueue> {
    /// A send queue that pulls from upstream storage. Only this queue's
    /// pacer bounds the bytes leaving for the network.
    pub fn with_source(
        local: ServerId,
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        source: Arc<dyn ServerMessageSource>,
        network: Arc<dyn Network>,
        listener: Arc<dyn ServerMessageListener>,
        hooks: Hooks,
    ) -> Self {
        let factory_source = Arc::clone(&source);
        Self::build(
            local,
            pacing,
            estimator,
            network,
            listener,
            hooks,
            Box::new(move |destination| SourceQueue::new(Arc::clone(&factory_source), destination)),
            Some(source),
        )
    }
}

impl<Q: FlowQueue<Item = ServerMessage>> FairServerMessageQueue<Q> {
    #[allow(clippy::too_many_arguments)]
    fn build(
        local: ServerId,
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        network: Arc<dyn Network>,
        listener: Arc<dyn ServerMessageListener>,
        hooks: Hooks,
        make_queue: QueueFactory<Q>,
        local_source: Option<Arc<dyn ServerMessageSource>>,
    ) -> Self {
        Self {
            local,
            data: Mutex::new(FairQueue::new(pacing.fair_queue_options())),
            pass: Mutex::new(PassState::new(pacing, estimator)),
            flow: FlowControl::new(pacing.rate_bytes_per_sec),
            network,
            listener,
            hooks,
            make_queue,
            local_source,
            default_weight: pacing.default_weight,
            max_message_bytes: pacing.max_message_bytes,
            min_retry: pacing.min_retry_interval(),
        }
    }

    pub fn local(&self) -> ServerId {
        self.local
    }

    /// Messages queued across all destinations.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn deliver_local(&self, message: ServerMessage) {
        let now = Instant::now();
        self.hooks.trace.server_message_sent(&message, now, now);
        self.listener.server_message_received(message);
    }

    fn ensure_destination(&self, data: &mut FairQueue<ServerId, Q>, destination: ServerId) {
        if data.contains(&destination) {
            return;
        }
        if let Err(e) = self.register_destination(data, destination, self.default_weight) {
            warn!(peer = %destination, error = %e, "failed to register destination");
        }
    }

    /// Add a flow for `destination` and open its connection so the peer
    /// sees it before the first message.
    fn register_destination(
        &self,
        data: &mut FairQueue<ServerId, Q>,
        destination: ServerId,
        weight: f64,
    ) -> FlowResult<()> {
        data.add_queue(destination, weight, (self.make_queue)(destination))?;
        if !self.network.connect(destination) {
            warn!(peer = %destination, "failed to open connection");
        }
        Ok(())
    }
}

impl<Q> ServerMessageQueue for FairServerMessageQueue<Q>
where
    Q: FlowQueue<Item = ServerMessage> + Send,
{
    fn service(&self, now: Instant) -> ServiceOutcome {
        let Some(mut pass) = self.pass.try_lock() else {
            return ServiceOutcome::Busy;
        };

        let mut budget = pass.pacer.begin(now);
        let opening = budget;
        // Destinations whose stream refused during this pass.
        let mut stalled = BTreeSet::new();
        let stop = loop {
            let mut sent = None;
            let outcome = self.data.lock().pop_with_excluding(
                &mut budget,
                &stalled,
                |destination, message| {
                    let bytes = match message.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(peer = %destination, error = %e, "dropping unencodable message");
                            return Ok(());
                        }
                    };
                    if self.network.try_send(*destination, &bytes) {
                        sent = Some(message);
                        Ok(())
                    } else {
                        Err(message)
                    }
                },
            );

            match outcome {
                PopOutcome::Delivered { key, size } => {
                    let (start, end) = pass.pacer.record_send(size, now);
                    if let Some(message) = &sent {
                        self.hooks.trace.server_message_sent(message, start, end);
                    }
                    self.hooks.metrics.record_sent("send", &key.to_string(), size);
                }
                PopOutcome::Blocked { needed, .. } => break Stop::Blocked { needed },
                PopOutcome::Refused { key } => {
                    debug!(peer = %key, "network refused send, skipping peer for this pass");
                    self.hooks
                        .metrics
                        .record_send_failure("send", &key.to_string());
                    stalled.insert(key);
                }
                PopOutcome::Empty if stalled.is_empty() => break Stop::Drained,
                PopOutcome::Empty => break Stop::Stalled,
            }
        };

        self.flow
            .close_pass(&mut pass, opening - budget, now, stop, self.min_retry)
    }

    fn message_ready(&self, destination: ServerId) {
        if destination == self.local {
            let Some(source) = &self.local_source else {
                return;
            };
            while let Some(message) = source.pull(destination) {
                self.deliver_local(message);
            }
            return;
        }

        let mut data = self.data.lock();
        self.ensure_destination(&mut data, destination);
        if let Err(e) = data.notify_nonempty(&destination) {
            warn!(peer = %destination, error = %e, "wake-up for unregistered destination");
        }
    }

    fn set_server_weight(&self, server: ServerId, weight: f64) -> FlowResult<()> {
        let mut data = self.data.lock();
        if data.contains(&server) {
            data.set_weight(&server, weight)
        } else {
            self.register_destination(&mut data, server, weight)
        }
    }

    fn remove_server(&self, server: ServerId) -> bool {
        self.data.lock().remove_queue(&server)
    }

    fn queue_info(&self) -> Vec<QueueInfo<ServerId>> {
        self.data.lock().queue_info()
    }

    fn capacity_estimate(&self) -> f64 {
        self.flow.capacity_estimate()
    }

    fn is_blocked(&self) -> bool {
        self.flow.is_blocked()
    }
}
