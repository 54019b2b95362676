use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Core OTel instruments for the fair queues. Created once per server and
/// shared by its send, receive and object queues through `Hooks`.
pub struct Metrics {
    pub bytes_sent: Counter<u64>,
    pub messages_sent: Counter<u64>,
    pub bytes_received: Counter<u64>,
    pub messages_received: Counter<u64>,
    pub messages_rejected: Counter<u64>,
    pub send_failures: Counter<u64>,
    pub queue_bytes: Gauge<u64>,
    pub queue_weight: Gauge<f64>,
    pub capacity_estimate: Gauge<f64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn attrs(direction: &str, key: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("direction", direction.to_string()),
        KeyValue::new("key", key.to_string()),
    ]
}

impl Metrics {
    /// Create metrics from the global meter provider. Without a configured
    /// provider the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("meridian");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            bytes_sent: meter
                .u64_counter("meridian.bytes.sent")
                .with_description("Bytes handed to the next stage")
                .build(),
            messages_sent: meter
                .u64_counter("meridian.messages.sent")
                .with_description("Messages handed to the next stage")
                .build(),
            bytes_received: meter
                .u64_counter("meridian.bytes.received")
                .with_description("Bytes delivered to the local listener")
                .build(),
            messages_received: meter
                .u64_counter("meridian.messages.received")
                .with_description("Messages delivered to the local listener")
                .build(),
            messages_rejected: meter
                .u64_counter("meridian.messages.rejected")
                .with_description("Pushes rejected by admission control")
                .build(),
            send_failures: meter
                .u64_counter("meridian.send.failures")
                .with_description("Service passes halted by a refused send")
                .build(),
            queue_bytes: meter
                .u64_gauge("meridian.queue.bytes")
                .with_description("Bytes queued per key")
                .build(),
            queue_weight: meter
                .f64_gauge("meridian.queue.weight")
                .with_description("Scheduling weight per key")
                .build(),
            capacity_estimate: meter
                .f64_gauge("meridian.capacity.estimate")
                .with_description("Estimated drain rate in bytes per second")
                .build(),
        }
    }

    pub fn record_sent(&self, direction: &str, key: &str, bytes: usize) {
        let attrs = attrs(direction, key);
        self.bytes_sent.add(bytes as u64, &attrs);
        self.messages_sent.add(1, &attrs);
    }

    pub fn record_received(&self, key: &str, bytes: usize) {
        let attrs = attrs("receive", key);
        self.bytes_received.add(bytes as u64, &attrs);
        self.messages_received.add(1, &attrs);
    }

    pub fn record_rejected(&self, direction: &str, key: &str) {
        self.messages_rejected.add(1, &attrs(direction, key));
    }

    pub fn record_send_failure(&self, direction: &str, key: &str) {
        self.send_failures.add(1, &attrs(direction, key));
    }

    pub fn set_queue_bytes(&self, direction: &str, key: &str, bytes: usize) {
        self.queue_bytes.record(bytes as u64, &attrs(direction, key));
    }

    pub fn set_queue_weight(&self, direction: &str, key: &str, weight: f64) {
        self.queue_weight.record(weight, &attrs(direction, key));
    }

    pub fn set_capacity_estimate(&self, direction: &str, bytes_per_sec: f64) {
        self.capacity_estimate.record(
            bytes_per_sec,
            &[KeyValue::new("direction", direction.to_string())],
        );
    }
}
