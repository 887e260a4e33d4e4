//! Metrics types for queue monitoring.

use std::time::Duration;

/// Point-in-time admission statistics, per capability or global.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMetrics {
    pub queued: usize,
    pub running: usize,
    pub total_admitted: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    pub avg_wait_ms: f64,
}

/// Running counters kept per capability name under the queue lock.
#[derive(Debug, Default)]
pub(super) struct CapabilityStats {
    pub(super) total_admitted: u64,
    pub(super) total_timeouts: u64,
    pub(super) total_cancelled: u64,
    pub(super) total_wait: Duration,
}

impl CapabilityStats {
    pub(super) fn avg_wait_ms(&self) -> f64 {
        if self.total_admitted == 0 {
            0.0
        } else {
            self.total_wait.as_secs_f64() * 1000.0 / self.total_admitted as f64
        }
    }

    pub(super) fn record_admission(&mut self, waited: Duration) {
        self.total_admitted += 1;
        self.total_wait += waited;
    }
}
