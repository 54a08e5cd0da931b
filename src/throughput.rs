//! Windowed throughput accounting for collecting-status reports.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Records committed blocks over a sliding window and derives rates for
/// status reports and logs. Purely observational: never consulted by the
/// state machine.
pub struct Throughput {
    window: Duration,
    samples: VecDeque<(SystemTime, usize)>,
}

impl Throughput {
    /// Create an accumulator over the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record a committed block of `bytes` at `now`.
    pub fn record(&mut self, now: SystemTime, bytes: usize) {
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    /// Blocks and bytes per second over the window ending at `now`.
    pub fn rates(&mut self, now: SystemTime) -> (f64, f64) {
        self.prune(now);
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let secs = self.window.as_secs_f64();
        let blocks = self.samples.len() as f64;
        let bytes: usize = self.samples.iter().map(|(_, bytes)| bytes).sum();
        (blocks / secs, bytes as f64 / secs)
    }

    /// Drop all samples (session end).
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: SystemTime) {
        let cutoff = now - self.window;
        while let Some((at, _)) = self.samples.front() {
            if *at >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rates_over_window() {
        let mut throughput = Throughput::new(Duration::from_secs(10));
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        for i in 0..5 {
            throughput.record(t0 + Duration::from_secs(i), 1000);
        }
        let (blocks, bytes) = throughput.rates(t0 + Duration::from_secs(5));
        assert_eq!(blocks, 0.5);
        assert_eq!(bytes, 500.0);
    }

    #[test]
    fn test_old_samples_pruned() {
        let mut throughput = Throughput::new(Duration::from_secs(10));
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        throughput.record(t0, 1000);
        let (blocks, _) = throughput.rates(t0 + Duration::from_secs(60));
        assert_eq!(blocks, 0.0);
    }

    #[test]
    fn test_reset() {
        let mut throughput = Throughput::new(Duration::from_secs(10));
        let t0 = UNIX_EPOCH + Duration::from_secs(100);
        throughput.record(t0, 1000);
        throughput.reset();
        assert_eq!(throughput.rates(t0).0, 0.0);
    }
}
