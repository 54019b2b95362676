use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::ForwarderConfig;
use crate::error::{FlowError, FlowResult, PushError};
use crate::fairness::fair_queue::{FairQueue, FairQueueOptions};
use crate::fairness::flow::BoundedQueue;
use crate::fairness::send::ServerMessageSource;
use crate::fairness::stats::QueueInfo;
use crate::fairness::ServerMessageSink;
use crate::message::{QueueMessage, ServerId, ServerMessage, ServiceTag};

/// Told when a destination has service messages waiting.
pub trait ServiceQueueListener: Send + Sync {
    fn service_message_ready(&self, destination: ServerId);
}

type ServiceQueues = FairQueue<ServiceTag, BoundedQueue<ServerMessage>>;

struct ForwarderState {
    services: BTreeMap<ServiceTag, f64>,
    destinations: HashMap<ServerId, ServiceQueues>,
}

/// Per-destination fair sharing among logical services.
///
/// This is the inner level of a two-level hierarchy: it orders messages
/// for one peer across services but has no byte budget of its own. The send
/// queue pulls from it and its pacer alone bounds what reaches the network.
pub struct ForwarderServiceQueue {
    state: Mutex<ForwarderState>,
    listener: RwLock<Option<Arc<dyn ServiceQueueListener>>>,
    capacity_bytes: usize,
    max_message_bytes: usize,
}

impl ForwarderServiceQueue {
    pub fn new(capacity_bytes: usize, max_message_bytes: usize) -> Self {
        Self {
            state: Mutex::new(ForwarderState {
                services: BTreeMap::new(),
                destinations: HashMap::new(),
            }),
            listener: RwLock::new(None),
            capacity_bytes,
            max_message_bytes,
        }
    }

    /// Build with the services listed in `config` already registered.
    pub fn from_config(config: &ForwarderConfig, max_message_bytes: usize) -> FlowResult<Self> {
        let forwarder = Self::new(config.service_queue_capacity_bytes, max_message_bytes);
        for service in &config.services {
            forwarder.add_service(ServiceTag(service.tag), service.weight)?;
        }
        Ok(forwarder)
    }

    pub fn set_listener(&self, listener: Arc<dyn ServiceQueueListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Register a service. Existing destinations get a sub-queue for it too.
    pub fn add_service(&self, service: ServiceTag, weight: f64) -> FlowResult<()> {
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(FlowError::InvalidWeight(weight));
        }
        let mut state = self.state.lock();
        if state.services.contains_key(&service) {
            return Err(FlowError::DuplicateFlow(service.to_string()));
        }
        let mut added = Vec::with_capacity(state.destinations.len());
        let mut failed = None;
        for (destination, queues) in state.destinations.iter_mut() {
            match queues.add_queue(service, weight, BoundedQueue::new(self.capacity_bytes)) {
                Ok(()) => added.push(*destination),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            for destination in &added {
                if let Some(queues) = state.destinations.get_mut(destination) {
                    queues.remove_queue(&service);
                }
            }
            return Err(e);
        }
        state.services.insert(service, weight);
        info!(%service, weight, "registered forwarder service");
        Ok(())
    }

    pub fn services(&self) -> Vec<(ServiceTag, f64)> {
        self.state
            .lock()
            .services
            .iter()
            .map(|(tag, weight)| (*tag, *weight))
            .collect()
    }

    /// Queue a message on its service for its destination and signal the
    /// listener. Never touches the network.
    pub fn push(&self, message: ServerMessage) -> Result<(), PushError<ServerMessage>> {
        let destination = message.destination();
        let service = message.service;
        {
            let mut state = self.state.lock();
            if !state.services.contains_key(&service) {
                return Err(PushError::UnknownFlow(message));
            }
            let queues = self.destination_queues(&mut state, destination);
            if let Err(e) = queues.push(&service, message) {
                debug!(peer = %destination, %service, "service queue rejected message");
                return Err(e);
            }
        }
        self.notify(destination);
        Ok(())
    }

    /// Whether `push` of a `size`-byte message on `service` would succeed.
    pub fn can_push(&self, destination: ServerId, service: ServiceTag, size: usize) -> bool {
        let state = self.state.lock();
        if !state.services.contains_key(&service) {
            return false;
        }
        match state.destinations.get(&destination) {
            Some(queues) => queues.can_push(&service, size),
            None => size <= self.max_message_bytes && size <= self.capacity_bytes,
        }
    }

    /// Size of the message `pop` would return next.
    pub fn front_size(&self, destination: ServerId) -> Option<usize> {
        self.state
            .lock()
            .destinations
            .get_mut(&destination)?
            .next_head_size()
    }

    /// Next message for `destination` in fair service order.
    pub fn pop(&self, destination: ServerId) -> Option<ServerMessage> {
        let mut state = self.state.lock();
        let queues = state.destinations.get_mut(&destination)?;
        let mut unlimited = usize::MAX;
        queues.pop(&mut unlimited).map(|(_, message)| message)
    }

    /// Return a message to the head of its service queue.
    pub fn restore(&self, destination: ServerId, message: ServerMessage) {
        let service = message.service;
        let mut state = self.state.lock();
        let Some(queues) = state.destinations.get_mut(&destination) else {
            debug!(peer = %destination, "dropping message for removed destination");
            return;
        };
        if queues.restore(&service, message).is_err() {
            debug!(peer = %destination, %service, "dropping message for unknown service");
        }
    }

    pub fn remove_destination(&self, destination: ServerId) -> bool {
        self.state.lock().destinations.remove(&destination).is_some()
    }

    pub fn queue_info(&self, destination: ServerId) -> Vec<QueueInfo<ServiceTag>> {
        self.state
            .lock()
            .destinations
            .get(&destination)
            .map(|queues| queues.queue_info())
            .unwrap_or_default()
    }

    fn destination_queues<'a>(
        &self,
        state: &'a mut ForwarderState,
        destination: ServerId,
    ) -> &'a mut ServiceQueues {
        let ForwarderState {
            services,
            destinations,
        } = state;
        destinations.entry(destination).or_insert_with(|| {
            let mut queues = FairQueue::new(FairQueueOptions {
                max_message_bytes: Some(self.max_message_bytes),
                ..Default::default()
            });
            for (service, weight) in services.iter() {
                // Services are unique and weights were validated on registration.
                let _ = queues.add_queue(*service, *weight, BoundedQueue::new(self.capacity_bytes));
            }
            queues
        })
    }

    fn notify(&self, destination: ServerId) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.service_message_ready(destination);
        }
    }
}

impl ServerMessageSource for ForwarderServiceQueue {
    fn front_size(&self, destination: ServerId) -> Option<usize> {
        ForwarderServiceQueue::front_size(self, destination)
    }

    fn pull(&self, destination: ServerId) -> Option<ServerMessage> {
        self.pop(destination)
    }

    fn restore(&self, destination: ServerId, message: ServerMessage) {
        ForwarderServiceQueue::restore(self, destination, message);
    }

    fn queued_bytes(&self, destination: ServerId) -> usize {
        self.state
            .lock()
            .destinations
            .get(&destination)
            .map(|queues| queues.queued_bytes())
            .unwrap_or(0)
    }

    fn queued_messages(&self, destination: ServerId) -> usize {
        self.state
            .lock()
            .destinations
            .get(&destination)
            .map(|queues| queues.len())
            .unwrap_or(0)
    }
}

impl ServerMessageSink for ForwarderServiceQueue {
    fn can_accept(&self, message: &ServerMessage) -> bool {
        self.can_push(message.destination(), message.service, message.size())
    }

    fn accept(&self, message: ServerMessage) -> Result<(), PushError<ServerMessage>> {
        self.push(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, PacingConfig};
    use crate::fairness::send::{FairServerMessageQueue, ServerMessageQueue};
    use crate::fairness::test_support::{CollectingListener, RecordingNetwork};
    use crate::fairness::ServiceOutcome;
    use crate::message::SERVER_MESSAGE_HEADER_BYTES;
    use crate::trace::Hooks;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct ReadyLog(Mutex<Vec<ServerId>>);

    impl ServiceQueueListener for ReadyLog {
        fn service_message_ready(&self, destination: ServerId) {
            self.0.lock().push(destination);
        }
    }

    fn msg(id: u64, destination: u32, service: ServiceTag, size: usize) -> ServerMessage {
        ServerMessage::new(
            id,
            ServerId(1),
            ServerId(destination),
            service,
            vec![0; size - SERVER_MESSAGE_HEADER_BYTES],
        )
    }

    fn forwarder() -> ForwarderServiceQueue {
        let f = ForwarderServiceQueue::new(10_000, 1000);
        f.add_service(ServiceTag::LOCATION, 1.0).unwrap();
        f.add_service(ServiceTag::PROXIMITY, 1.0).unwrap();
        f.add_service(ServiceTag::OBJECT_ROUTING, 2.0).unwrap();
        f
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let f = forwarder();
        assert!(matches!(
            f.add_service(ServiceTag::LOCATION, 5.0),
            Err(FlowError::DuplicateFlow(_))
        ));
        assert!(f.add_service(ServiceTag(9), 1.0).is_ok());
        assert_eq!(f.services().len(), 4);
    }

    #[test]
    fn late_service_reaches_existing_destinations() {
        let f = forwarder();
        f.push(msg(1, 2, ServiceTag::LOCATION, 100)).unwrap();
        f.add_service(ServiceTag(9), 1.0).unwrap();
        assert!(f.push(msg(2, 2, ServiceTag(9), 100)).is_ok());
        assert_eq!(f.queue_info(ServerId(2)).len(), 4);
    }

    #[test]
    fn failed_service_registration_leaves_no_partial_state() {
        let f = forwarder();
        f.push(msg(1, 2, ServiceTag::LOCATION, 100)).unwrap();
        f.push(msg(2, 3, ServiceTag::LOCATION, 100)).unwrap();
        // Destination 3 already carries a queue for the tag.
        f.state
            .lock()
            .destinations
            .get_mut(&ServerId(3))
            .unwrap()
            .add_queue(ServiceTag(9), 1.0, BoundedQueue::new(100))
            .unwrap();

        assert!(matches!(
            f.add_service(ServiceTag(9), 1.0),
            Err(FlowError::DuplicateFlow(_))
        ));
        assert!(!f.services().iter().any(|(tag, _)| *tag == ServiceTag(9)));
        assert_eq!(f.queue_info(ServerId(2)).len(), 3);
        assert!(matches!(
            f.push(msg(3, 2, ServiceTag(9), 100)),
            Err(PushError::UnknownFlow(_))
        ));
    }

    #[test]
    fn push_notifies_listener_and_rejects_unknown_service() {
        let f = forwarder();
        let log = Arc::new(ReadyLog::default());
        f.set_listener(log.clone());

        f.push(msg(1, 2, ServiceTag::PROXIMITY, 100)).unwrap();
        f.push(msg(2, 3, ServiceTag::LOCATION, 100)).unwrap();
        assert_eq!(*log.0.lock(), vec![ServerId(2), ServerId(3)]);

        let err = f.push(msg(3, 2, ServiceTag(77), 100)).unwrap_err();
        assert!(matches!(err, PushError::UnknownFlow(_)));
        assert_eq!(log.0.lock().len(), 2);
    }

    #[test]
    fn pop_orders_services_by_weight() {
        let f = forwarder();
        for i in 0..4 {
            f.push(msg(i, 2, ServiceTag::LOCATION, 100)).unwrap();
            f.push(msg(10 + i, 2, ServiceTag::OBJECT_ROUTING, 100)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| f.pop(ServerId(2))).map(|m| m.id).collect();
        // Object routing (weight 2) finishes every 50 virtual seconds,
        // location (weight 1) every 100.
        assert_eq!(order, vec![10, 0, 11, 12, 1, 13, 2, 3]);
        assert!(f.pop(ServerId(9)).is_none());
    }

    #[test]
    fn can_push_predicts_push() {
        let f = ForwarderServiceQueue::new(250, 200);
        f.add_service(ServiceTag::LOCATION, 1.0).unwrap();
        assert!(f.can_push(ServerId(2), ServiceTag::LOCATION, 200));
        assert!(!f.can_push(ServerId(2), ServiceTag::LOCATION, 201));
        assert!(!f.can_push(ServerId(2), ServiceTag::PROXIMITY, 10));

        f.push(msg(1, 2, ServiceTag::LOCATION, 200)).unwrap();
        assert!(!f.can_push(ServerId(2), ServiceTag::LOCATION, 100));
        assert!(f.push(msg(2, 2, ServiceTag::LOCATION, 100)).unwrap_err().is_full());
        assert!(f.can_push(ServerId(2), ServiceTag::LOCATION, 50));
    }

    #[test]
    fn restore_and_remove_destination() {
        let f = forwarder();
        f.push(msg(1, 2, ServiceTag::LOCATION, 100)).unwrap();
        let head = f.pop(ServerId(2)).unwrap();
        f.restore(ServerId(2), head);
        assert_eq!(f.front_size(ServerId(2)), Some(100));

        assert!(f.remove_destination(ServerId(2)));
        assert!(!f.remove_destination(ServerId(2)));
        assert_eq!(f.front_size(ServerId(2)), None);
        assert!(f.queue_info(ServerId(2)).is_empty());
    }

    #[test]
    fn peer_pacer_alone_bounds_throughput_across_services() {
        const RATE: f64 = 20_000.0;
        let f = Arc::new(forwarder());
        let network = Arc::new(RecordingNetwork::default());
        let pacing = PacingConfig {
            rate_bytes_per_sec: RATE,
            ..Default::default()
        };
        let send = FairServerMessageQueue::with_source(
            ServerId(1),
            &pacing,
            &EstimatorConfig::default(),
            f.clone(),
            network.clone(),
            Arc::new(CollectingListener::default()),
            Hooks::default(),
        );

        let services = [ServiceTag::LOCATION, ServiceTag::PROXIMITY, ServiceTag::OBJECT_ROUTING];
        let mut id = 0;
        for _ in 0..30 {
            for service in services {
                f.push(msg(id, 2, service, 200)).unwrap();
                id += 1;
            }
        }
        send.message_ready(ServerId(2));

        let start = Instant::now();
        send.service(start);
        for step in 1..=10 {
            let outcome = send.service(start + Duration::from_millis(50 * step));
            assert!(matches!(outcome, ServiceOutcome::Blocked { .. }));
            // 20 kB/s for 50 ms per step: exactly five 200-byte messages.
            assert_eq!(network.sent_bytes(), 1000 * step as usize);
        }

        // Services share 1:1:2; object routing leads each round, so it holds
        // 25 of the first 50 messages.
        let sent = network.sent.lock();
        let routing = sent
            .iter()
            .filter(|m| m.service == ServiceTag::OBJECT_ROUTING)
            .count();
        assert_eq!(sent.len(), 50);
        assert_eq!(routing, 25);
    }

    /// Lets a producer slip one message in between the send queue's size
    /// check and its pull.
    struct CuttingSource {
        inner: Arc<ForwarderServiceQueue>,
        cut_in: Mutex<Option<ServerMessage>>,
    }

    impl ServerMessageSource for CuttingSource {
        fn front_size(&self, destination: ServerId) -> Option<usize> {
            self.inner.front_size(destination)
        }

        fn pull(&self, destination: ServerId) -> Option<ServerMessage> {
            if let Some(message) = self.cut_in.lock().take() {
                self.inner.push(message).unwrap();
            }
            self.inner.pop(destination)
        }

        fn restore(&self, destination: ServerId, message: ServerMessage) {
            self.inner.restore(destination, message);
        }

        fn queued_bytes(&self, destination: ServerId) -> usize {
            ServerMessageSource::queued_bytes(&*self.inner, destination)
        }

        fn queued_messages(&self, destination: ServerId) -> usize {
            ServerMessageSource::queued_messages(&*self.inner, destination)
        }
    }

    #[test]
    fn message_pushed_during_pull_is_charged_its_own_size() {
        let f = Arc::new(forwarder());
        let source = Arc::new(CuttingSource {
            inner: f.clone(),
            cut_in: Mutex::new(Some(msg(99, 2, ServiceTag::OBJECT_ROUTING, 150))),
        });
        let network = Arc::new(RecordingNetwork::default());
        let pacing = PacingConfig {
            rate_bytes_per_sec: 10_000.0,
            ..Default::default()
        };
        let send = FairServerMessageQueue::with_source(
            ServerId(1),
            &pacing,
            &EstimatorConfig::default(),
            source,
            network.clone(),
            Arc::new(CollectingListener::default()),
            Hooks::default(),
        );
        f.push(msg(1, 2, ServiceTag::LOCATION, 100)).unwrap();
        send.message_ready(ServerId(2));

        // 100 bytes of budget: the 100-byte head passes the check but the
        // 150-byte message that jumped ahead is what comes out.
        let start = Instant::now();
        send.service(start);
        let outcome = send.service(start + Duration::from_millis(10));
        assert!(matches!(outcome, ServiceOutcome::Blocked { .. }));
        assert!(network.sent_ids().is_empty());
        assert_eq!(ServerMessageSource::queued_messages(&*f, ServerId(2)), 2);

        send.service(start + Duration::from_millis(40));
        let mut ids = network.sent_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 99]);
        assert!(network.sent_bytes() <= 400);
    }

    #[test]
    fn local_destination_drains_to_listener() {
        let f = Arc::new(forwarder());
        let listener = Arc::new(CollectingListener::default());
        let send = FairServerMessageQueue::with_source(
            ServerId(1),
            &PacingConfig::default(),
            &EstimatorConfig::default(),
            f.clone(),
            Arc::new(RecordingNetwork::default()),
            listener.clone(),
            Hooks::default(),
        );
        f.push(msg(5, 1, ServiceTag::LOCATION, 100)).unwrap();
        send.message_ready(ServerId(1));
        assert_eq!(listener.ids(), vec![5]);
        assert_eq!(f.front_size(ServerId(1)), None);
    }
}
