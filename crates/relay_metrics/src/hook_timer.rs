//! Per-call hook latency

use super::ring_buffer::RingBuffer;
use std::time::Duration;

/// Rolling window of hook call durations. Callers measure the call themselves
/// and hand the elapsed time over once the call has returned.
#[derive(Debug)]
pub struct HookTimer {
    latencies: RingBuffer<Duration>,
}

impl HookTimer {
    pub fn new(window: usize) -> Self {
        Self {
            latencies: RingBuffer::new(window),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.latencies.push(elapsed);
    }

    /// Calls currently in the window.
    pub fn samples(&self) -> usize {
        self.latencies.len()
    }

    pub fn average_ms(&self) -> f64 {
        to_ms(self.latencies.average())
    }

    /// Fastest and slowest call in the window.
    pub fn range_ms(&self) -> (f64, f64) {
        let (fastest, slowest) = self.latencies.min_max();
        (to_ms(fastest), to_ms(slowest))
    }
}

fn to_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl Default for HookTimer {
    fn default() -> Self {
        Self::new(128)
    }
}
