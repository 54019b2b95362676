use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{EstimatorConfig, ObjectQueueConfig, ObjectQueueKind, PacingConfig};
use crate::error::{FlowError, FlowResult, PushError};
use crate::fairness::fair_queue::{FairQueue, PopOutcome};
use crate::fairness::flow::{BoundedQueue, FlowQueue, PushQueue};
use crate::fairness::stats::QueueInfo;
use crate::fairness::{FlowControl, PassState, ServerMessageSink, ServiceOutcome, Stop};
use crate::message::{ObjectId, ObjectMessage, QueueMessage, ServerId, ServerMessage, ServiceTag};
use crate::trace::Hooks;

/// Next stage for object messages. Hands the message back when it cannot
/// take it now.
pub trait ObjectMessageRouter: Send + Sync {
    fn try_route(&self, message: ObjectMessage) -> Result<(), ObjectMessage>;
}

/// Paced queue of messages from the objects connected to this server.
pub trait ObjectMessageQueue: Send + Sync {
    fn register_client(&self, object: ObjectId, weight: f64) -> FlowResult<()>;

    /// Drops the client and anything it still has queued.
    fn unregister_client(&self, object: ObjectId) -> bool;

    fn push(&self, message: ObjectMessage) -> Result<(), PushError<ObjectMessage>>;

    fn can_push(&self, object: ObjectId, size: usize) -> bool;

    fn set_weight(&self, object: ObjectId, weight: f64) -> FlowResult<()>;

    fn service(&self, now: Instant) -> ServiceOutcome;

    fn queue_info(&self) -> Vec<QueueInfo<ObjectId>>;
}

/// What happens to an object's weight when the router refuses its message.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendFailurePolicy {
    /// Leave the weight alone.
    #[default]
    Keep,
    /// Multiply the weight by `factor`, never below `floor`. The registered
    /// weight comes back with the object's next routed message.
    Deprioritize { factor: f64, floor: f64 },
}

/// Build the object queue selected by `config.kind`.
pub fn object_queue_from_config(
    config: &ObjectQueueConfig,
    estimator: &EstimatorConfig,
    router: Arc<dyn ObjectMessageRouter>,
    hooks: Hooks,
) -> Arc<dyn ObjectMessageQueue> {
    match config.kind {
        ObjectQueueKind::Fair => Arc::new(FairObjectMessageQueue::new(
            &config.pacing,
            estimator,
            config.send_failure,
            router,
            hooks,
        )),
        ObjectQueueKind::Fifo => Arc::new(FifoObjectMessageQueue::new(
            &config.pacing,
            estimator,
            router,
            hooks,
        )),
    }
}

struct FairObjects {
    queue: FairQueue<ObjectId, BoundedQueue<ObjectMessage>>,
    /// Weights as registered, restored after a deprioritized object recovers.
    registered: HashMap<ObjectId, f64>,
}

/// Weighted fair sharing of the object budget, one sub-queue per object.
pub struct FairObjectMessageQueue {
    data: Mutex<FairObjects>,
    pass: Mutex<PassState>,
    flow: FlowControl,
    router: Arc<dyn ObjectMessageRouter>,
    policy: SendFailurePolicy,
    hooks: Hooks,
    capacity_bytes: usize,
    min_retry: Duration,
}

impl FairObjectMessageQueue {
    pub fn new(
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        policy: SendFailurePolicy,
        router: Arc<dyn ObjectMessageRouter>,
        hooks: Hooks,
    ) -> Self {
        Self {
            data: Mutex::new(FairObjects {
                queue: FairQueue::new(pacing.fair_queue_options()),
                registered: HashMap::new(),
            }),
            pass: Mutex::new(PassState::new(pacing, estimator)),
            flow: FlowControl::new(pacing.rate_bytes_per_sec),
            router,
            policy,
            hooks,
            capacity_bytes: pacing.queue_capacity_bytes,
            min_retry: pacing.min_retry_interval(),
        }
    }

    pub fn weight(&self, object: ObjectId) -> Option<f64> {
        self.data.lock().queue.weight(&object)
    }

    fn on_refused(&self, data: &mut FairObjects, object: ObjectId) {
        let SendFailurePolicy::Deprioritize { factor, floor } = self.policy else {
            return;
        };
        let Some(current) = data.queue.weight(&object) else {
            return;
        };
        let lowered = (current * factor).max(floor.min(current));
        if lowered != current {
            debug!(%object, from = current, to = lowered, "deprioritizing object after failed route");
            if let Err(e) = data.queue.set_weight(&object, lowered) {
                warn!(%object, error = %e, "failed to deprioritize object");
            }
        }
    }

    fn on_routed(&self, data: &mut FairObjects, object: ObjectId) {
        if self.policy == SendFailurePolicy::Keep {
            return;
        }
        let Some(&registered) = data.registered.get(&object) else {
            return;
        };
        if data.queue.weight(&object) != Some(registered) {
            if let Err(e) = data.queue.set_weight(&object, registered) {
                warn!(%object, error = %e, "failed to restore object weight");
            }
        }
    }
}

impl ObjectMessageQueue for FairObjectMessageQueue {
    fn register_client(&self, object: ObjectId, weight: f64) -> FlowResult<()> {
        let mut data = self.data.lock();
        data.queue
            .add_queue(object, weight, BoundedQueue::new(self.capacity_bytes))?;
        data.registered.insert(object, weight);
        Ok(())
    }

    fn unregister_client(&self, object: ObjectId) -> bool {
        let mut data = self.data.lock();
        data.registered.remove(&object);
        data.queue.remove_queue(&object)
    }

    fn push(&self, message: ObjectMessage) -> Result<(), PushError<ObjectMessage>> {
        let object = message.source;
        self.data
            .lock()
            .queue
            .push(&object, message)
            .inspect_err(|_| {
                debug!(%object, "object queue rejected message");
                self.hooks.metrics.record_rejected("objects", &object.to_string());
            })
    }

    fn can_push(&self, object: ObjectId, size: usize) -> bool {
        self.data.lock().queue.can_push(&object, size)
    }

    fn set_weight(&self, object: ObjectId, weight: f64) -> FlowResult<()> {
        let mut data = self.data.lock();
        data.queue.set_weight(&object, weight)?;
        data.registered.insert(object, weight);
        Ok(())
    }

    fn service(&self, now: Instant) -> ServiceOutcome {
        let Some(mut pass) = self.pass.try_lock() else {
            return ServiceOutcome::Busy;
        };

        let mut budget = pass.pacer.begin(now);
        let opening = budget;
        // Objects whose messages could not be routed sit out the rest of
        // the pass.
        let mut unroutable = BTreeSet::new();
        let stop = loop {
            let mut routed = None;
            let outcome = {
                let mut data = self.data.lock();
                let outcome =
                    data.queue
                        .pop_with_excluding(&mut budget, &unroutable, |_, message| {
                            let id = message.id;
                            self.router.try_route(message).map(|()| routed = Some(id))
                        });
                match &outcome {
                    PopOutcome::Delivered { key, .. } => self.on_routed(&mut data, *key),
                    PopOutcome::Refused { key } => self.on_refused(&mut data, *key),
                    _ => {}
                }
                outcome
            };

            match outcome {
                PopOutcome::Delivered { key, size } => {
                    let (start, end) = pass.pacer.record_send(size, now);
                    if let Some(id) = routed {
                        self.hooks
                            .trace
                            .object_message_routed(key, id, size, start, end);
                    }
                    self.hooks.metrics.record_sent("objects", &key.to_string(), size);
                }
                PopOutcome::Blocked { needed, .. } => break Stop::Blocked { needed },
                PopOutcome::Refused { key } => {
                    self.hooks
                        .metrics
                        .record_send_failure("objects", &key.to_string());
                    unroutable.insert(key);
                }
                PopOutcome::Empty if unroutable.is_empty() => break Stop::Drained,
                PopOutcome::Empty => break Stop::Stalled,
            }
        };

        self.flow
            .close_pass(&mut pass, opening - budget, now, stop, self.min_retry)
    }

    fn queue_info(&self) -> Vec<QueueInfo<ObjectId>> {
        self.data.lock().queue.queue_info()
    }
}

struct FifoObjects {
    queue: BoundedQueue<ObjectMessage>,
    clients: HashMap<ObjectId, f64>,
}

/// Single shared FIFO for all objects, paced like the fair variant.
/// Weights are recorded for reporting but do not affect order.
pub struct FifoObjectMessageQueue {
    data: Mutex<FifoObjects>,
    pass: Mutex<PassState>,
    flow: FlowControl,
    router: Arc<dyn ObjectMessageRouter>,
    hooks: Hooks,
    max_message_bytes: usize,
    min_retry: Duration,
}

impl FifoObjectMessageQueue {
    pub fn new(
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        router: Arc<dyn ObjectMessageRouter>,
        hooks: Hooks,
    ) -> Self {
        Self {
            data: Mutex::new(FifoObjects {
                queue: BoundedQueue::new(pacing.queue_capacity_bytes),
                clients: HashMap::new(),
            }),
            pass: Mutex::new(PassState::new(pacing, estimator)),
            flow: FlowControl::new(pacing.rate_bytes_per_sec),
            router,
            hooks,
            max_message_bytes: pacing.max_message_bytes,
            min_retry: pacing.min_retry_interval(),
        }
    }
}

impl ObjectMessageQueue for FifoObjectMessageQueue {
    fn register_client(&self, object: ObjectId, weight: f64) -> FlowResult<()> {
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(FlowError::InvalidWeight(weight));
        }
        let mut data = self.data.lock();
        if data.clients.contains_key(&object) {
            return Err(FlowError::DuplicateFlow(object.to_string()));
        }
        data.clients.insert(object, weight);
        Ok(())
    }

    fn unregister_client(&self, object: ObjectId) -> bool {
        let mut data = self.data.lock();
        if data.clients.remove(&object).is_none() {
            return false;
        }
        let dropped = data.queue.retain(|m| m.source != object);
        if dropped > 0 {
            debug!(%object, dropped, "dropped queued messages of unregistered object");
        }
        true
    }

    fn push(&self, message: ObjectMessage) -> Result<(), PushError<ObjectMessage>> {
        let object = message.source;
        let size = message.size();
        let mut data = self.data.lock();
        let result = if !data.clients.contains_key(&object) {
            Err(PushError::UnknownFlow(message))
        } else if size > self.max_message_bytes {
            Err(PushError::Oversized {
                message,
                size,
                limit: self.max_message_bytes,
            })
        } else {
            data.queue.push(message).map_err(PushError::Full)
        };
        if result.is_err() {
            debug!(%object, "object queue rejected message");
            self.hooks.metrics.record_rejected("objects", &object.to_string());
        }
        result
    }

    fn can_push(&self, object: ObjectId, size: usize) -> bool {
        let data = self.data.lock();
        data.clients.contains_key(&object)
            && size <= self.max_message_bytes
            && data.queue.can_push(size)
    }

    fn set_weight(&self, object: ObjectId, weight: f64) -> FlowResult<()> {
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(FlowError::InvalidWeight(weight));
        }
        let mut data = self.data.lock();
        let slot = data
            .clients
            .get_mut(&object)
            .ok_or_else(|| FlowError::UnknownFlow(object.to_string()))?;
        *slot = weight;
        Ok(())
    }

    fn service(&self, now: Instant) -> ServiceOutcome {
        let Some(mut pass) = self.pass.try_lock() else {
            return ServiceOutcome::Busy;
        };

        let mut budget = pass.pacer.begin(now);
        let opening = budget;
        let stop = loop {
            let routed = {
                let mut data = self.data.lock();
                let Some(size) = data.queue.head_size() else {
                    break Stop::Drained;
                };
                if size > budget {
                    break Stop::Blocked { needed: size };
                }
                let Some(message) = data.queue.pop() else {
                    break Stop::Drained;
                };
                let (object, id) = (message.source, message.id);
                match self.router.try_route(message) {
                    Ok(()) => {
                        budget -= size;
                        (object, id, size)
                    }
                    Err(message) => {
                        data.queue.restore(message);
                        self.hooks
                            .metrics
                            .record_send_failure("objects", &object.to_string());
                        break Stop::Stalled;
                    }
                }
            };

            let (object, id, size) = routed;
            let (start, end) = pass.pacer.record_send(size, now);
            self.hooks
                .trace
                .object_message_routed(object, id, size, start, end);
            self.hooks.metrics.record_sent("objects", &object.to_string(), size);
        };

        self.flow
            .close_pass(&mut pass, opening - budget, now, stop, self.min_retry)
    }

    fn queue_info(&self) -> Vec<QueueInfo<ObjectId>> {
        let data = self.data.lock();
        data.clients
            .iter()
            .map(|(object, weight)| {
                let (pending, used) = data
                    .queue
                    .iter()
                    .filter(|m| m.source == *object)
                    .fold((0, 0), |(n, bytes), m| (n + 1, bytes + m.size()));
                QueueInfo {
                    key: *object,
                    capacity: None,
                    used,
                    pending,
                    weight: *weight,
                }
            })
            .collect()
    }
}

/// Finds the server currently hosting an object.
pub trait ObjectLocator: Send + Sync {
    fn locate(&self, object: ObjectId) -> Option<ServerId>;
}

/// Locator backed by an in-memory table.
#[derive(Default)]
pub struct DirectoryLocator {
    entries: RwLock<HashMap<ObjectId, ServerId>>,
}

impl DirectoryLocator {
    pub fn insert(&self, object: ObjectId, server: ServerId) {
        self.entries.write().insert(object, server);
    }

    pub fn remove(&self, object: ObjectId) -> Option<ServerId> {
        self.entries.write().remove(&object)
    }
}

impl ObjectLocator for DirectoryLocator {
    fn locate(&self, object: ObjectId) -> Option<ServerId> {
        self.entries.read().get(&object).copied()
    }
}

/// Routes object messages to the server hosting their destination by
/// wrapping them into server messages on the object routing service.
pub struct ServerRoutingAdapter {
    local: ServerId,
    locator: Arc<dyn ObjectLocator>,
    sink: Arc<dyn ServerMessageSink>,
    next_id: AtomicU64,
}

impl ServerRoutingAdapter {
    pub fn new(
        local: ServerId,
        locator: Arc<dyn ObjectLocator>,
        sink: Arc<dyn ServerMessageSink>,
    ) -> Self {
        Self {
            local,
            locator,
            sink,
            next_id: AtomicU64::new(0),
        }
    }
}

impl ObjectMessageRouter for ServerRoutingAdapter {
    fn try_route(&self, message: ObjectMessage) -> Result<(), ObjectMessage> {
        let Some(server) = self.locator.locate(message.destination) else {
            debug!(object = %message.destination, "no server known for object");
            return Err(message);
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = message.id, error = %e, "dropping unencodable object message");
                return Ok(());
            }
        };
        let wrapped = ServerMessage::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            self.local,
            server,
            ServiceTag::OBJECT_ROUTING,
            payload,
        );
        if !self.sink.can_accept(&wrapped) {
            return Err(message);
        }
        self.sink.accept(wrapped).map_err(|_| message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::forwarder::ForwarderServiceQueue;
    use crate::message::OBJECT_MESSAGE_HEADER_BYTES;
    use std::sync::atomic::AtomicBool;

    const RATE: f64 = 10_000.0;

    #[derive(Default)]
    struct TestRouter {
        routed: Mutex<Vec<ObjectMessage>>,
        refuse: AtomicBool,
        /// Sources whose messages are always handed back.
        unknown: Mutex<Vec<ObjectId>>,
    }

    impl TestRouter {
        fn ids(&self) -> Vec<u64> {
            self.routed.lock().iter().map(|m| m.id).collect()
        }
    }

    impl ObjectMessageRouter for TestRouter {
        fn try_route(&self, message: ObjectMessage) -> Result<(), ObjectMessage> {
            if self.refuse.load(Ordering::SeqCst) || self.unknown.lock().contains(&message.source)
            {
                return Err(message);
            }
            self.routed.lock().push(message);
            Ok(())
        }
    }

    fn pacing() -> PacingConfig {
        PacingConfig {
            rate_bytes_per_sec: RATE,
            queue_capacity_bytes: 2000,
            max_message_bytes: 500,
            ..Default::default()
        }
    }

    fn msg(id: u64, source: ObjectId, size: usize) -> ObjectMessage {
        ObjectMessage::new(
            id,
            source,
            ObjectId::random(),
            vec![0; size - OBJECT_MESSAGE_HEADER_BYTES],
        )
    }

    fn fair(policy: SendFailurePolicy) -> (FairObjectMessageQueue, Arc<TestRouter>) {
        let router = Arc::new(TestRouter::default());
        let queue = FairObjectMessageQueue::new(
            &pacing(),
            &EstimatorConfig::default(),
            policy,
            router.clone(),
            Hooks::default(),
        );
        (queue, router)
    }

    /// Prime the pacer at `start` and run a pass `ms` later.
    fn run_for(queue: &dyn ObjectMessageQueue, start: Instant, ms: u64) -> ServiceOutcome {
        queue.service(start);
        queue.service(start + Duration::from_millis(ms))
    }

    #[test]
    fn fair_queue_shares_budget_between_objects() {
        let (queue, router) = fair(SendFailurePolicy::Keep);
        let (a, b) = (ObjectId::random(), ObjectId::random());
        queue.register_client(a, 1.0).unwrap();
        queue.register_client(b, 1.0).unwrap();
        for i in 0..10 {
            queue.push(msg(i, a, 100)).unwrap();
            queue.push(msg(100 + i, b, 100)).unwrap();
        }

        let outcome = run_for(&queue, Instant::now(), 60);
        assert!(matches!(outcome, ServiceOutcome::Blocked { .. }));
        let ids = router.ids();
        assert_eq!(ids.len(), 6);
        assert_eq!(ids.iter().filter(|id| **id < 100).count(), 3);
    }

    #[test]
    fn unregistered_object_cannot_push() {
        let (queue, _) = fair(SendFailurePolicy::Keep);
        let stranger = ObjectId::random();
        assert!(!queue.can_push(stranger, 100));
        assert!(matches!(
            queue.push(msg(1, stranger, 100)),
            Err(PushError::UnknownFlow(_))
        ));
    }

    #[test]
    fn refused_route_keeps_message_queued() {
        let (queue, router) = fair(SendFailurePolicy::Keep);
        let a = ObjectId::random();
        queue.register_client(a, 2.0).unwrap();
        queue.push(msg(1, a, 100)).unwrap();

        router.refuse.store(true, Ordering::SeqCst);
        let start = Instant::now();
        assert_eq!(run_for(&queue, start, 50), ServiceOutcome::Stalled);
        assert_eq!(queue.weight(a), Some(2.0));
        assert_eq!(queue.queue_info()[0].pending, 1);

        router.refuse.store(false, Ordering::SeqCst);
        assert_eq!(queue.service(start + Duration::from_millis(50)), ServiceOutcome::Drained);
        assert_eq!(router.ids(), vec![1]);
    }

    #[test]
    fn unroutable_object_does_not_hold_back_others() {
        let (queue, router) = fair(SendFailurePolicy::Keep);
        let (a, b) = (ObjectId::random(), ObjectId::random());
        queue.register_client(a, 1.0).unwrap();
        queue.register_client(b, 1.0).unwrap();
        router.unknown.lock().push(a);
        for i in 0..5 {
            queue.push(msg(i, a, 100)).unwrap();
            queue.push(msg(100 + i, b, 100)).unwrap();
        }

        let start = Instant::now();
        queue.service(start);
        let mut last = ServiceOutcome::Busy;
        for pass in 1..=20 {
            last = queue.service(start + Duration::from_millis(100 * pass));
        }
        assert_eq!(router.ids(), vec![100, 101, 102, 103, 104]);
        assert_eq!(last, ServiceOutcome::Stalled);
        let info = queue.queue_info();
        let pending_a = info.iter().find(|i| i.key == a).map(|i| i.pending);
        assert_eq!(pending_a, Some(5));
    }

    #[test]
    fn deprioritize_lowers_weight_until_next_success() {
        let (queue, router) = fair(SendFailurePolicy::Deprioritize {
            factor: 0.5,
            floor: 0.25,
        });
        let a = ObjectId::random();
        queue.register_client(a, 1.0).unwrap();
        queue.push(msg(1, a, 100)).unwrap();

        router.refuse.store(true, Ordering::SeqCst);
        let start = Instant::now();
        run_for(&queue, start, 50);
        assert_eq!(queue.weight(a), Some(0.5));
        queue.service(start + Duration::from_millis(60));
        assert_eq!(queue.weight(a), Some(0.25));
        queue.service(start + Duration::from_millis(70));
        assert_eq!(queue.weight(a), Some(0.25));

        router.refuse.store(false, Ordering::SeqCst);
        queue.service(start + Duration::from_millis(80));
        assert_eq!(queue.weight(a), Some(1.0));
    }

    #[test]
    fn fifo_preserves_arrival_order_across_objects() {
        let router = Arc::new(TestRouter::default());
        let queue = FifoObjectMessageQueue::new(
            &pacing(),
            &EstimatorConfig::default(),
            router.clone(),
            Hooks::default(),
        );
        let (a, b) = (ObjectId::random(), ObjectId::random());
        queue.register_client(a, 5.0).unwrap();
        queue.register_client(b, 1.0).unwrap();
        for i in 0..3 {
            queue.push(msg(i, a, 100)).unwrap();
        }
        for i in 3..6 {
            queue.push(msg(i, b, 100)).unwrap();
        }

        let outcome = run_for(&queue, Instant::now(), 40);
        assert!(matches!(outcome, ServiceOutcome::Blocked { .. }));
        assert_eq!(router.ids(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn fifo_unregister_drops_pending_messages() {
        let router = Arc::new(TestRouter::default());
        let queue = FifoObjectMessageQueue::new(
            &pacing(),
            &EstimatorConfig::default(),
            router,
            Hooks::default(),
        );
        let (a, b) = (ObjectId::random(), ObjectId::random());
        queue.register_client(a, 1.0).unwrap();
        queue.register_client(b, 1.0).unwrap();
        queue.push(msg(1, a, 100)).unwrap();
        queue.push(msg(2, b, 200)).unwrap();

        assert!(queue.unregister_client(a));
        assert!(!queue.unregister_client(a));
        let info = queue.queue_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].key, b);
        assert_eq!(info[0].used, 200);
        assert!(matches!(
            queue.register_client(b, 1.0),
            Err(FlowError::DuplicateFlow(_))
        ));
    }

    #[test]
    fn fifo_admission_matches_push() {
        let queue = FifoObjectMessageQueue::new(
            &pacing(),
            &EstimatorConfig::default(),
            Arc::new(TestRouter::default()),
            Hooks::default(),
        );
        let a = ObjectId::random();
        queue.register_client(a, 1.0).unwrap();
        assert!(!queue.can_push(a, 501));
        assert!(matches!(
            queue.push(msg(1, a, 501)),
            Err(PushError::Oversized { .. })
        ));
        for i in 0..4 {
            assert!(queue.can_push(a, 500));
            queue.push(msg(i, a, 500)).unwrap();
        }
        assert!(!queue.can_push(a, 100));
        assert!(queue.push(msg(9, a, 100)).unwrap_err().is_full());
    }

    #[test]
    fn routing_adapter_wraps_into_object_routing_service() {
        let forwarder = Arc::new(ForwarderServiceQueue::new(10_000, 1000));
        forwarder.add_service(ServiceTag::OBJECT_ROUTING, 1.0).unwrap();
        let locator = Arc::new(DirectoryLocator::default());
        let adapter = ServerRoutingAdapter::new(ServerId(1), locator.clone(), forwarder.clone());

        let target = ObjectId::random();
        let message = ObjectMessage::new(7, ObjectId::random(), target, vec![1, 2, 3]);

        // Unknown location: handed back untouched.
        let returned = adapter.try_route(message.clone()).unwrap_err();
        assert_eq!(returned, message);

        locator.insert(target, ServerId(4));
        adapter.try_route(message.clone()).unwrap();
        let wrapped = forwarder.pop(ServerId(4)).unwrap();
        assert_eq!(wrapped.service, ServiceTag::OBJECT_ROUTING);
        assert_eq!(wrapped.source, ServerId(1));
        assert_eq!(wrapped.object_message().unwrap(), message);
    }

    #[test]
    fn routing_adapter_hands_back_when_forwarder_is_full() {
        let forwarder = Arc::new(ForwarderServiceQueue::new(200, 1000));
        forwarder.add_service(ServiceTag::OBJECT_ROUTING, 1.0).unwrap();
        let locator = Arc::new(DirectoryLocator::default());
        let adapter = ServerRoutingAdapter::new(ServerId(1), locator.clone(), forwarder);

        let target = ObjectId::random();
        locator.insert(target, ServerId(2));
        let big = ObjectMessage::new(1, ObjectId::random(), target, vec![0; 300]);
        assert_eq!(adapter.try_route(big.clone()).unwrap_err(), big);
    }
}
