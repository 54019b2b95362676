use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{EstimatorConfig, PacingConfig};
use crate::error::FlowResult;
use crate::fairness::fair_queue::{FairQueue, PopOutcome};
use crate::fairness::flow::FlowQueue;
use crate::fairness::stats::QueueInfo;
use crate::fairness::{FlowControl, PassState, ServiceOutcome, Stop};
use crate::message::{ServerId, ServerMessage};
use crate::network::{ReceiveNetwork, ServerMessageListener};
use crate::trace::Hooks;

/// Inbound side: drains the transport's per-peer buffers into the local
/// listener at the receive rate, fairly across peers.
pub trait ServerMessageReceiver: Send + Sync {
    fn network_received_connection(&self, peer: ServerId);

    /// Edge-triggered: `peer`'s buffer went from empty to non-empty.
    fn network_received_data(&self, peer: ServerId);

    fn service(&self, now: Instant) -> ServiceOutcome;

    fn set_server_weight(&self, server: ServerId, weight: f64) -> FlowResult<()>;

    fn remove_server(&self, server: ServerId) -> bool;

    fn queue_info(&self) -> Vec<QueueInfo<ServerId>>;

    fn capacity_estimate(&self) -> f64;

    fn is_blocked(&self) -> bool;
}

/// Flow storage that is the transport's own receive buffer for one peer.
pub struct ReceiveQueue {
    network: Arc<dyn ReceiveNetwork>,
    peer: ServerId,
}

impl FlowQueue for ReceiveQueue {
    type Item = ServerMessage;

    fn head_size(&self) -> Option<usize> {
        self.network.front_size(self.peer)
    }

    fn pop(&mut self) -> Option<ServerMessage> {
        self.network.receive(self.peer)
    }

    fn restore(&mut self, item: ServerMessage) {
        self.network.requeue_front(self.peer, item);
    }

    fn len(&self) -> usize {
        self.network.queued_messages(self.peer)
    }

    fn queued_bytes(&self) -> usize {
        self.network.queued_bytes(self.peer)
    }

    fn capacity_bytes(&self) -> Option<usize> {
        None
    }
}

pub struct FairServerMessageReceiver {
    data: Mutex<FairQueue<ServerId, ReceiveQueue>>,
    pass: Mutex<PassState>,
    flow: FlowControl,
    network: Arc<dyn ReceiveNetwork>,
    listener: Arc<dyn ServerMessageListener>,
    hooks: Hooks,
    default_weight: f64,
    min_retry: Duration,
}

impl FairServerMessageReceiver {
    pub fn new(
        pacing: &PacingConfig,
        estimator: &EstimatorConfig,
        network: Arc<dyn ReceiveNetwork>,
        listener: Arc<dyn ServerMessageListener>,
        hooks: Hooks,
    ) -> Self {
        Self {
            data: Mutex::new(FairQueue::new(pacing.fair_queue_options())),
            pass: Mutex::new(PassState::new(pacing, estimator)),
            flow: FlowControl::new(pacing.rate_bytes_per_sec),
            network,
            listener,
            hooks,
            default_weight: pacing.default_weight,
            min_retry: pacing.min_retry_interval(),
        }
    }

    fn register(&self, data: &mut FairQueue<ServerId, ReceiveQueue>, peer: ServerId) {
        if data.contains(&peer) {
            return;
        }
        // A new peer starts at the average so it neither dominates nor
        // starves before weights are negotiated.
        let weight = data.average_weight().unwrap_or(self.default_weight);
        let queue = ReceiveQueue {
            network: Arc::clone(&self.network),
            peer,
        };
        match data.add_queue(peer, weight, queue) {
            Ok(()) => debug!(peer = %peer, weight, "registered receive queue"),
            Err(e) => warn!(peer = %peer, error = %e, "failed to register receive queue"),
        }
    }
}

impl ServerMessageReceiver for FairServerMessageReceiver {
    fn network_received_connection(&self, peer: ServerId) {
        let mut data = self.data.lock();
        self.register(&mut data, peer);
    }

    fn network_received_data(&self, peer: ServerId) {
        let mut data = self.data.lock();
        self.register(&mut data, peer);
        if let Err(e) = data.notify_nonempty(&peer) {
            warn!(peer = %peer, error = %e, "wake-up for unregistered peer");
        }
    }

    fn service(&self, now: Instant) -> ServiceOutcome {
        let Some(mut pass) = self.pass.try_lock() else {
            return ServiceOutcome::Busy;
        };

        let mut budget = pass.pacer.begin(now);
        let opening = budget;
        let stop = loop {
            let mut received = None;
            let outcome = self.data.lock().pop_with(&mut budget, |_, message| {
                received = Some(message);
                Ok(())
            });
            match outcome {
                PopOutcome::Delivered { key, size } => {
                    let Some(message) = received else { continue };
                    // Deliver outside the data lock; the listener may call back in.
                    self.hooks.trace.server_message_received(&message, now);
                    self.hooks.metrics.record_received(&key.to_string(), size);
                    self.listener.server_message_received(message);
                }
                PopOutcome::Blocked { needed, .. } => break Stop::Blocked { needed },
                PopOutcome::Refused { .. } => break Stop::Stalled,
                PopOutcome::Empty => break Stop::Drained,
            }
        };

        self.flow
            .close_pass(&mut pass, opening - budget, now, stop, self.min_retry)
    }

    fn set_server_weight(&self, server: ServerId, weight: f64) -> FlowResult<()> {
        let mut data = self.data.lock();
        self.register(&mut data, server);
        data.set_weight(&server, weight)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::test_support::CollectingListener;
    use crate::message::{ServiceTag, SERVER_MESSAGE_HEADER_BYTES};
    use crate::network::{MemoryEndpoint, MemoryNetwork, Network};

    const RATE: f64 = 10_000.0;

    struct Fixture {
        net: MemoryNetwork,
        receiver: FairServerMessageReceiver,
        listener: Arc<CollectingListener>,
    }

    fn fixture() -> Fixture {
        let net = MemoryNetwork::new(1 << 20);
        let listener = Arc::new(CollectingListener::default());
        let pacing = PacingConfig {
            rate_bytes_per_sec: RATE,
            min_retry_interval_us: 1000,
            ..Default::default()
        };
        let receiver = FairServerMessageReceiver::new(
            &pacing,
            &EstimatorConfig::default(),
            Arc::new(net.endpoint(ServerId(1))),
            listener.clone(),
            Hooks::default(),
        );
        Fixture {
            net,
            receiver,
            listener,
        }
    }

    fn send(from: &MemoryEndpoint, id: u64, size: usize) {
        let msg = ServerMessage::new(
            id,
            from.local(),
            ServerId(1),
            ServiceTag::PROXIMITY,
            vec![0; size - SERVER_MESSAGE_HEADER_BYTES],
        );
        assert!(from.try_send(ServerId(1), &msg.encode().unwrap()));
    }

    #[test]
    fn new_peers_start_at_average_weight() {
        let f = fixture();
        f.receiver.network_received_connection(ServerId(2));
        f.receiver.set_server_weight(ServerId(2), 3.0).unwrap();
        f.receiver.network_received_connection(ServerId(3));
        f.receiver.set_server_weight(ServerId(3), 1.0).unwrap();
        f.receiver.network_received_connection(ServerId(4));

        let info = f.receiver.queue_info();
        let four = info.iter().find(|i| i.key == ServerId(4)).unwrap();
        assert_eq!(four.weight, 2.0);
        assert_eq!(four.capacity, None);
    }

    #[test]
    fn delivers_from_network_buffers_at_rate() {
        let f = fixture();
        let peer = f.net.endpoint(ServerId(2));
        for i in 0..4 {
            send(&peer, i, 100);
        }
        f.receiver.network_received_data(ServerId(2));
        let info = f.receiver.queue_info();
        assert_eq!(info[0].pending, 4);
        assert_eq!(info[0].used, 400);

        let start = Instant::now();
        f.receiver.service(start);
        let outcome = f.receiver.service(start + Duration::from_millis(20));
        assert!(matches!(outcome, ServiceOutcome::Blocked { .. }));
        assert_eq!(f.listener.ids(), vec![0, 1]);

        let outcome = f.receiver.service(start + Duration::from_millis(40));
        assert_eq!(outcome, ServiceOutcome::Drained);
        assert_eq!(f.listener.ids(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn blocked_retry_is_floored_at_minimum_interval() {
        let f = fixture();
        let peer = f.net.endpoint(ServerId(2));
        send(&peer, 0, 100);
        f.receiver.network_received_data(ServerId(2));
        let start = Instant::now();
        f.receiver.service(start);
        // 99.9 bytes accrued: the deficit alone would retry after 10 us.
        let outcome = f.receiver.service(start + Duration::from_micros(9_990));
        assert_eq!(
            outcome,
            ServiceOutcome::Blocked {
                retry_after: Some(Duration::from_millis(1))
            }
        );
    }

    #[test]
    fn unknown_peer_data_registers_lazily() {
        let f = fixture();
        let peer = f.net.endpoint(ServerId(5));
        send(&peer, 7, 50);
        f.receiver.network_received_data(ServerId(5));
        let start = Instant::now();
        f.receiver.service(start);
        f.receiver.service(start + Duration::from_millis(10));
        assert_eq!(f.listener.ids(), vec![7]);
    }

    #[test]
    fn fair_share_across_peers() {
        let f = fixture();
        let a = f.net.endpoint(ServerId(2));
        let b = f.net.endpoint(ServerId(3));
        for i in 0..20 {
            send(&a, i, 100);
            send(&b, 100 + i, 100);
        }
        f.receiver.network_received_data(ServerId(2));
        f.receiver.network_received_data(ServerId(3));
        let start = Instant::now();
        f.receiver.service(start);
        f.receiver.service(start + Duration::from_millis(100));

        let ids = f.listener.ids();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids.iter().filter(|id| **id < 100).count(), 5);
    }
}
