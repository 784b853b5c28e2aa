// # Async Coordination Primitives
//
// Foundation module every other subsystem depends on: the four-level
// priority queue with backpressure, the retry decorator, the bounded task
// executor, the timed batcher, and the wildcard event bus.

pub mod batcher;
pub mod event_bus;
pub mod executor;
pub mod priority_queue;
pub mod retry;

pub use batcher::{BatchHandler, Batcher, BatcherConfig};
pub use event_bus::{topics, EventBus, EventHandler, EventMessage, SubscriptionId};
pub use executor::{BoundedExecutor, ExecutorMetricsSnapshot};
pub use priority_queue::{BackpressurePolicy, Priority, PriorityQueue, QueueMetricsSnapshot};
pub use retry::{retry, retry_if, RetryConfig};
