// # Bounded Task Executor
//
// A concurrency pool sized by a semaphore. Submitted units run in parallel
// up to the configured width; excess submissions suspend in FIFO order.
// Per-operation metrics are kept for the health and monitoring surfaces.

use crate::error::{DbError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct OpMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

/// Point-in-time metrics for one named operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorMetricsSnapshot {
    pub operation: String,
    pub calls: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub mean_duration_ms: f64,
}

/// Semaphore-bounded executor shared across subsystems.
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    width: usize,
    in_flight: AtomicUsize,
    max_observed: AtomicUsize,
    metrics: DashMap<String, OpMetrics>,
}

impl BoundedExecutor {
    pub fn new(width: usize) -> Self {
        assert!(width > 0, "executor width must be positive");
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
            in_flight: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
            metrics: DashMap::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run a unit under the concurrency bound, suspending if the pool is at
    /// capacity. Metrics are recorded under `operation`.
    pub async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DbError::Internal("executor closed".to_string()))?;

        let running = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_observed.fetch_max(running, Ordering::Relaxed);
        let started = Instant::now();

        let result = fut.await;

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        let entry = self.metrics.entry(operation.to_string()).or_default();
        entry.calls.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            entry.failures.fetch_add(1, Ordering::Relaxed);
        }
        entry
            .total_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        result
    }

    /// Highest concurrency level ever observed.
    pub fn max_concurrent_observed(&self) -> usize {
        self.max_observed.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Vec<ExecutorMetricsSnapshot> {
        self.metrics
            .iter()
            .map(|entry| {
                let calls = entry.calls.load(Ordering::Relaxed);
                let failures = entry.failures.load(Ordering::Relaxed);
                let total = entry.total_micros.load(Ordering::Relaxed);
                ExecutorMetricsSnapshot {
                    operation: entry.key().clone(),
                    calls,
                    failures,
                    success_rate: if calls > 0 {
                        (calls - failures) as f64 / calls as f64
                    } else {
                        1.0
                    },
                    mean_duration_ms: if calls > 0 {
                        total as f64 / calls as f64 / 1000.0
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrency() {
        let exec = Arc::new(BoundedExecutor::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let exec = Arc::clone(&exec);
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            handles.push(tokio::spawn(async move {
                exec.run("probe", async {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(exec.max_concurrent_observed(), 2);
    }

    #[tokio::test]
    async fn records_success_rate_and_duration() {
        let exec = BoundedExecutor::new(4);
        exec.run("op", async { Ok(()) }).await.unwrap();
        exec.run("op", async { Ok(()) }).await.unwrap();
        let _ = exec
            .run("op", async { Err::<(), _>(DbError::Internal("boom".into())) })
            .await;

        let m = exec
            .metrics()
            .into_iter()
            .find(|m| m.operation == "op")
            .unwrap();
        assert_eq!(m.calls, 3);
        assert_eq!(m.failures, 1);
        assert!((m.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
