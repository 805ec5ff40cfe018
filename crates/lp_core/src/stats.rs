//! Throughput counters.
//!
//! Updated under the core lock, so the figures are exact rather than
//! sampled. The patrol thread clones a snapshot every pass.

use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct AllocationStats {
    pub allocation_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,

    /// How many allocations matched an already-suspicious fingerprint.
    pub allocation_with_suspicious_fingerprint_count: u64,

    /// Set on the first instrumented operation after watching was enabled.
    pub enabled: bool,
    time_watch_enabled: Option<Instant>,
}

impl AllocationStats {
    pub fn ensure_enabled(&mut self) {
        if !self.enabled {
            self.enabled = true;
            self.time_watch_enabled = Some(Instant::now());
        }
    }

    /// How long watching has been active. `None` until the first
    /// instrumented operation.
    pub fn time_since_enabled(&self) -> Option<Duration> {
        self.time_watch_enabled.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_enabled_is_idempotent() {
        let mut stats = AllocationStats::default();
        assert!(!stats.enabled);
        assert!(stats.time_since_enabled().is_none());

        stats.ensure_enabled();
        assert!(stats.enabled);
        let first = stats.time_watch_enabled;

        stats.ensure_enabled();
        assert_eq!(stats.time_watch_enabled, first);
    }
}
