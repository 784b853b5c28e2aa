// # Pool Metrics
//
// Lock-free counters snapshot-readable without touching the pool's own
// locks, so monitoring never contends with acquisition.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub created: AtomicU64,
    pub closed: AtomicU64,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub discarded: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub probe_failures: AtomicU64,
    pub in_use: AtomicUsize,
    pub peak_in_use: AtomicUsize,
    wait_total_micros: AtomicU64,
    wait_samples: AtomicU64,
}

impl PoolMetrics {
    pub fn record_acquire(&self, wait_micros: u64) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.wait_total_micros.fetch_add(wait_micros, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);
        let now = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_use.fetch_max(now, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let samples = self.wait_samples.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            peak_in_use: self.peak_in_use.load(Ordering::Relaxed),
            mean_wait_ms: if samples > 0 {
                self.wait_total_micros.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub created: u64,
    pub closed: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub acquire_timeouts: u64,
    pub probe_failures: u64,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub mean_wait_ms: f64,
}
