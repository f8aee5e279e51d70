//! Network tendency meter: a bounded window of recent successful probe
//! round-trips. Configurations with adaptive timing scale their probe
//! timeout by the window's upper percentile instead of a fixed constant.

use std::collections::VecDeque;
use std::time::Duration;

/// Percentile used for adaptive probe timeouts.
const TIMEOUT_PERCENTILE: f64 = 0.99;

#[derive(Clone, Debug)]
pub struct LatencyMeter {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl LatencyMeter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn observe(&mut self, rtt: Duration) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The 99th-percentile round-trip of the current window, if any
    /// samples have been recorded.
    #[must_use]
    pub fn high_percentile(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * TIMEOUT_PERCENTILE).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    /// Probe timeout to use: the observed upper percentile when enough
    /// history exists, otherwise the configured floor. Never shorter than
    /// the floor.
    #[must_use]
    pub fn probe_timeout(&self, floor: Duration) -> Duration {
        match self.high_percentile() {
            Some(p99) => p99.max(floor),
            None => floor,
        }
    }
}
