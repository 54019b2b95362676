use std::fmt::Display;

/// Occupancy and weight of one flow, consumed by diagnostics, tracing and
/// the weight negotiation between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueInfo<K> {
    pub key: K,
    /// Byte capacity of the flow's storage, `None` when bounded elsewhere.
    pub capacity: Option<usize>,
    /// Bytes currently queued.
    pub used: usize,
    /// Messages currently queued.
    pub pending: usize,
    pub weight: f64,
}

impl<K: Display> QueueInfo<K> {
    /// Fraction of capacity in use, `None` for flows without a local bound.
    pub fn utilization(&self) -> Option<f64> {
        match self.capacity {
            Some(0) => Some(1.0),
            Some(cap) => Some(self.used as f64 / cap as f64),
            None => None,
        }
    }
}

/// Sum of queued bytes across a report.
pub fn total_used<K>(infos: &[QueueInfo<K>]) -> usize {
    infos.iter().map(|i| i.used).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_handles_unbounded_and_empty_capacity() {
        let bounded = QueueInfo {
            key: "a",
            capacity: Some(200),
            used: 50,
            pending: 1,
            weight: 1.0,
        };
        assert_eq!(bounded.utilization(), Some(0.25));

        let external = QueueInfo {
            capacity: None,
            ..bounded.clone()
        };
        assert_eq!(external.utilization(), None);
        assert_eq!(total_used(&[bounded, external]), 100);
    }
}
