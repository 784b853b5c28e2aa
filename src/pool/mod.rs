// # Connection Pool Manager
//
// Per-descriptor pools with bounded size, FIFO acquisition, idle reaping and
// background health probes, plus the manager that owns every descriptor
// from `register` to `unregister`.

pub mod connection_pool;
pub mod manager;
pub mod pool_metrics;

pub use connection_pool::{ConnectionPool, PooledConnection};
pub use manager::PoolManager;
pub use pool_metrics::{PoolMetrics, PoolMetricsSnapshot};
