use std::time::{Duration, Instant};

/// Exponentially weighted estimate of the bytes per second a queue drains.
///
/// Each sample folds the bytes sent since the previous sample into the
/// average with `alpha = exp(-dt / window)`, so bursts of closely spaced
/// samples move the estimate less than a sample after a long gap.
#[derive(Debug)]
pub struct CapacityEstimator {
    window: Duration,
    optimism_factor: f64,
    rate: f64,
    /// Bytes recorded at the same instant as the previous sample.
    pending_bytes: usize,
    last_sample: Option<Instant>,
}

impl CapacityEstimator {
    /// Start from the configured link rate.
    pub fn new(initial_rate: f64, window: Duration, optimism_factor: f64) -> Self {
        Self {
            window,
            optimism_factor: optimism_factor.max(1.0),
            rate: initial_rate.max(0.0),
            pending_bytes: 0,
            last_sample: None,
        }
    }

    /// Fold `bytes` sent during the interval ending at `now` into the estimate.
    pub fn record(&mut self, bytes: usize, now: Instant) {
        let Some(last) = self.last_sample else {
            self.last_sample = Some(now);
            return;
        };
        let dt = now.saturating_duration_since(last).as_secs_f64();
        if dt <= 0.0 {
            self.pending_bytes += bytes;
            return;
        }
        let bytes = bytes + std::mem::take(&mut self.pending_bytes);
        self.last_sample = Some(now);
        let window = self.window.as_secs_f64().max(f64::EPSILON);
        let alpha = (-dt / window).exp();
        let instantaneous = bytes as f64 / dt;
        self.rate = alpha * self.rate + (1.0 - alpha) * instantaneous;
    }

    /// The estimate handed to upstream flow control. While the queue is
    /// blocked the measured rate is reported as is. Otherwise the link was
    /// not the limit and the estimate is inflated so producers probe for
    /// more capacity.
    pub fn estimate(&self, blocked: bool) -> f64 {
        if blocked {
            self.rate
        } else {
            self.rate * self.optimism_factor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_configured_rate() {
        let est = CapacityEstimator::new(5000.0, Duration::from_millis(200), 1.25);
        assert_eq!(est.estimate(true), 5000.0);
        assert_eq!(est.estimate(false), 6250.0);
    }

    #[test]
    fn converges_toward_observed_rate() {
        let start = Instant::now();
        let mut est = CapacityEstimator::new(10_000.0, Duration::from_millis(200), 1.0);
        est.record(0, start);
        for i in 1..=200 {
            // 1000 B/s observed: 10 bytes every 10 ms.
            est.record(10, start + Duration::from_millis(10 * i));
        }
        assert!((est.estimate(true) - 1000.0).abs() < 10.0, "{}", est.estimate(true));
    }

    #[test]
    fn long_gap_weights_new_sample_heavily() {
        let start = Instant::now();
        let mut est = CapacityEstimator::new(0.0, Duration::from_millis(200), 1.0);
        est.record(0, start);
        est.record(2000, start + Duration::from_secs(2));
        // alpha = exp(-10), essentially the instantaneous 1000 B/s.
        assert!((est.estimate(true) - 1000.0).abs() < 1.0);
    }

    #[test]
    fn samples_at_same_instant_do_not_divide_by_zero() {
        let start = Instant::now();
        let mut est = CapacityEstimator::new(100.0, Duration::from_millis(200), 1.0);
        est.record(0, start);
        est.record(50, start);
        assert_eq!(est.estimate(true), 100.0);

        // The held bytes count toward the next interval.
        est.record(50, start + Duration::from_secs(10));
        assert!((est.estimate(true) - 10.0).abs() < 0.01);
    }
}
