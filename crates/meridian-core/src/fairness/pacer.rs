use std::time::{Duration, Instant};

const BYTE_EPSILON: f64 = 1e-6;

/// Byte budget accounting for one paced service pass.
///
/// Bytes accrue continuously at the configured rate since the last pass.
/// Unlike a token bucket there is no burst cap: an unspent remainder is
/// carried only while the queue stays backlogged and is forfeited as soon
/// as it drains, so an idle link cannot save up a burst.
///
/// Owned by the service mutex of one queue direction, no synchronization
/// of its own.
#[derive(Debug)]
pub struct BytePacer {
    rate_bytes_per_sec: f64,
    /// Fractional bytes carried between passes.
    remainder: f64,
    /// Start of the elapsed window; `None` until the first pass so a freshly
    /// created link does not start with a burst.
    last_service: Option<Instant>,
    /// Budget available at the start of the current pass.
    available: f64,
    /// Synthetic send clock, advanced by `size / rate` per message so trace
    /// timestamps reflect serialized transmission.
    send_clock: Option<Instant>,
}

/// How a service pass ended, from the pacer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEnd {
    /// Nothing left to send: forfeit the remainder.
    Drained,
    /// Stopped on budget: carry the unspent bytes.
    OutOfBudget,
    /// The next stage refused: keep the budget, restart timing from now.
    Stalled,
}

impl BytePacer {
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec.max(0.0),
            remainder: 0.0,
            last_service: None,
            available: 0.0,
            send_clock: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate_bytes_per_sec
    }

    /// Change the rate. Bytes already accrued are kept.
    pub fn set_rate(&mut self, rate_bytes_per_sec: f64) {
        self.rate_bytes_per_sec = rate_bytes_per_sec.max(0.0);
    }

    /// Open a pass at `now` and return the whole-byte budget:
    /// `remainder + elapsed * rate`.
    pub fn begin(&mut self, now: Instant) -> usize {
        let elapsed = self
            .last_service
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.available = self.remainder + elapsed * self.rate_bytes_per_sec;
        self.last_service = Some(now);
        if self.send_clock.map_or(true, |clock| clock < now) {
            self.send_clock = Some(now);
        }
        // Absorb float error in elapsed * rate before truncating to bytes.
        (self.available + BYTE_EPSILON).floor() as usize
    }

    /// Advance the synthetic send clock by one message and return its
    /// start and end timestamps.
    pub fn record_send(&mut self, size: usize, now: Instant) -> (Instant, Instant) {
        let start = self.send_clock.unwrap_or(now);
        let end = start + self.transmit_time(size);
        self.send_clock = Some(end);
        (start, end)
    }

    /// Close the pass after `spent` bytes were charged.
    pub fn finish(&mut self, spent: usize, now: Instant, end: PassEnd) {
        match end {
            PassEnd::Drained => {
                self.remainder = 0.0;
                self.last_service = Some(now);
                self.send_clock = Some(now);
            }
            PassEnd::OutOfBudget => {
                self.remainder = (self.available - spent as f64).max(0.0);
            }
            PassEnd::Stalled => {
                self.remainder = (self.available - spent as f64).max(0.0);
                self.last_service = Some(now);
                self.send_clock = Some(now);
            }
        }
        self.available = 0.0;
    }

    /// Bytes carried into the next pass.
    pub fn remainder(&self) -> f64 {
        self.remainder
    }

    /// Time until `needed` bytes will have accrued, given the carried
    /// remainder. `None` when the rate is zero.
    pub fn time_until(&self, needed: usize) -> Option<Duration> {
        let deficit = needed as f64 - self.remainder;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.rate_bytes_per_sec <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(deficit / self.rate_bytes_per_sec).ok()
    }

    fn transmit_time(&self, size: usize) -> Duration {
        if self.rate_bytes_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(size as f64 / self.rate_bytes_per_sec).unwrap_or(Duration::ZERO)
    }
}
