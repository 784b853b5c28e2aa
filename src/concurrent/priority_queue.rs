// # Priority Task Queue
//
// Four-level priority queue (CRITICAL > HIGH > NORMAL > LOW) with a
// configurable backpressure policy. Consumers suspend on `get` until an item
// arrives; CRITICAL items always precede lower levels and ordering within a
// level is FIFO. Acquisition order among consumers follows the tokio
// semaphore's FIFO wait queue.

use crate::error::{DbError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Scheduling priority. Discriminants double as level indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const LEVELS: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// What `put` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Fail fast with QUEUE_FULL
    RejectNew,
    /// Evict the oldest item from the lowest-priority non-empty level
    DropOldest,
    /// Suspend the producer until space frees up
    BlockBounded,
}

/// Point-in-time queue metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub size_per_level: [usize; Priority::LEVELS],
    pub total_size: usize,
    pub rejected: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub mean_wait_ms: f64,
}

struct QueueState<T> {
    levels: [VecDeque<(T, Instant)>; Priority::LEVELS],
    closed: bool,
}

impl<T> QueueState<T> {
    fn total_len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn pop_highest(&mut self) -> Option<(T, Instant)> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    fn drop_oldest_lowest(&mut self) -> bool {
        for level in self.levels.iter_mut().rev() {
            if level.pop_front().is_some() {
                return true;
            }
        }
        false
    }
}

/// Bounded multi-priority queue shared between producers and consumers.
pub struct PriorityQueue<T> {
    state: Mutex<QueueState<T>>,
    /// One permit per queued item; `get` suspends on this.
    items: Arc<Semaphore>,
    /// One permit per free slot; producers consume on `put`.
    space: Arc<Semaphore>,
    capacity: usize,
    policy: BackpressurePolicy,
    rejected: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    wait_total_micros: AtomicU64,
}

impl<T: Send> PriorityQueue<T> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                levels: [const { VecDeque::new() }; Priority::LEVELS],
                closed: false,
            }),
            items: Arc::new(Semaphore::new(0)),
            space: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            wait_total_micros: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an item at the given priority, applying the backpressure
    /// policy when full.
    pub async fn put(&self, item: T, priority: Priority) -> Result<()> {
        match self.policy {
            BackpressurePolicy::RejectNew => match self.space.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    self.push(item, priority);
                    Ok(())
                }
                Err(_) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(DbError::QueueFull(format!(
                        "capacity {} reached",
                        self.capacity
                    )))
                }
            },
            BackpressurePolicy::BlockBounded => {
                let permit = self
                    .space
                    .acquire()
                    .await
                    .map_err(|_| DbError::Internal("queue closed".to_string()))?;
                permit.forget();
                self.push(item, priority);
                Ok(())
            }
            BackpressurePolicy::DropOldest => {
                if let Ok(permit) = self.space.try_acquire() {
                    permit.forget();
                    self.push(item, priority);
                    return Ok(());
                }
                // Full: evict from the back of the priority order, then the
                // net item count is unchanged so no permit accounting moves.
                let evicted = {
                    let mut state = self.state.lock();
                    let evicted = state.drop_oldest_lowest();
                    if evicted {
                        state.levels[priority.index()].push_back((item, Instant::now()));
                    }
                    evicted
                };
                if evicted {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    // Raced with consumers draining the queue; retry the
                    // fast path once.
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(DbError::QueueFull("eviction raced with drain".to_string()))
                }
            }
        }
    }

    fn push(&self, item: T, priority: Priority) {
        {
            let mut state = self.state.lock();
            state.levels[priority.index()].push_back((item, Instant::now()));
        }
        self.items.add_permits(1);
    }

    /// Dequeue the highest-priority item, suspending until one is available.
    pub async fn get(&self) -> Result<T> {
        let permit = self
            .items
            .acquire()
            .await
            .map_err(|_| DbError::Internal("queue closed".to_string()))?;
        permit.forget();

        let (item, enqueued_at) = {
            let mut state = self.state.lock();
            state.pop_highest().ok_or_else(|| {
                DbError::InvariantViolated("item permit granted on empty queue".to_string())
            })?
        };
        self.space.add_permits(1);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.wait_total_micros.fetch_add(
            enqueued_at.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
        Ok(item)
    }

    /// Non-suspending variant used by drains and tests.
    pub fn try_get(&self) -> Option<T> {
        let permit = self.items.try_acquire().ok()?;
        permit.forget();
        let popped = self.state.lock().pop_highest();
        match popped {
            Some((item, enqueued_at)) => {
                self.space.add_permits(1);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.wait_total_micros.fetch_add(
                    enqueued_at.elapsed().as_micros() as u64,
                    Ordering::Relaxed,
                );
                Some(item)
            }
            None => None,
        }
    }

    /// Close the queue. Pending and future `get`/`put` calls fail.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.items.close();
        self.space.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        let size_per_level = {
            let state = self.state.lock();
            [
                state.levels[0].len(),
                state.levels[1].len(),
                state.levels[2].len(),
                state.levels[3].len(),
            ]
        };
        let delivered = self.delivered.load(Ordering::Relaxed);
        let mean_wait_ms = if delivered > 0 {
            self.wait_total_micros.load(Ordering::Relaxed) as f64 / delivered as f64 / 1000.0
        } else {
            0.0
        };
        QueueMetricsSnapshot {
            size_per_level,
            total_size: size_per_level.iter().sum(),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered,
            mean_wait_ms,
        }
    }
}

/// Wait for an item with a deadline. `Duration::ZERO` polls without waiting.
pub async fn get_with_timeout<T: Send>(
    queue: &PriorityQueue<T>,
    deadline: Duration,
) -> Result<T> {
    if deadline.is_zero() {
        return queue
            .try_get()
            .ok_or_else(|| DbError::Timeout(Duration::ZERO));
    }
    tokio::time::timeout(deadline, queue.get())
        .await
        .map_err(|_| DbError::Timeout(deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn critical_precedes_all_lower_levels() {
        let q = PriorityQueue::new(16, BackpressurePolicy::RejectNew);
        q.put("low", Priority::Low).await.unwrap();
        q.put("normal", Priority::Normal).await.unwrap();
        q.put("critical", Priority::Critical).await.unwrap();
        q.put("high", Priority::High).await.unwrap();

        assert_eq!(q.get().await.unwrap(), "critical");
        assert_eq!(q.get().await.unwrap(), "high");
        assert_eq!(q.get().await.unwrap(), "normal");
        assert_eq!(q.get().await.unwrap(), "low");
    }

    #[tokio::test]
    async fn fifo_within_a_level() {
        let q = PriorityQueue::new(16, BackpressurePolicy::RejectNew);
        for i in 0..5 {
            q.put(i, Priority::Normal).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.get().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn reject_new_fails_fast_when_full() {
        let q = PriorityQueue::new(2, BackpressurePolicy::RejectNew);
        q.put(1, Priority::Normal).await.unwrap();
        q.put(2, Priority::Normal).await.unwrap();
        let err = q.put(3, Priority::Normal).await.unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");
        assert_eq!(q.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_lowest_priority() {
        let q = PriorityQueue::new(2, BackpressurePolicy::DropOldest);
        q.put("old-low", Priority::Low).await.unwrap();
        q.put("high", Priority::High).await.unwrap();
        q.put("critical", Priority::Critical).await.unwrap();

        assert_eq!(q.metrics().dropped, 1);
        assert_eq!(q.get().await.unwrap(), "critical");
        assert_eq!(q.get().await.unwrap(), "high");
        assert!(q.try_get().is_none());
    }

    #[tokio::test]
    async fn block_bounded_resumes_after_drain() {
        let q = Arc::new(PriorityQueue::new(1, BackpressurePolicy::BlockBounded));
        q.put(1u32, Priority::Normal).await.unwrap();

        let q2 = Arc::clone(&q);
        let producer = tokio::spawn(async move { q2.put(2u32, Priority::Normal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.get().await.unwrap(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(q.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_with_zero_timeout_polls() {
        let q: PriorityQueue<u8> = PriorityQueue::new(4, BackpressurePolicy::RejectNew);
        let err = get_with_timeout(&q, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        q.put(9, Priority::Low).await.unwrap();
        assert_eq!(get_with_timeout(&q, Duration::ZERO).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn consumer_suspends_until_item_arrives() {
        let q = Arc::new(PriorityQueue::new(4, BackpressurePolicy::RejectNew));
        let q2 = Arc::clone(&q);
        let consumer = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.put(77u64, Priority::Critical).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), 77);
        assert!(q.metrics().delivered >= 1);
    }
}
