// # Per-Descriptor Connection Pool
//
// Bounded pool with FIFO acquisition (tokio semaphore wait queue), idle
// reaping back to min_size, and periodic health probes on idle connections.
// Acquisition blocks up to the descriptor's acquire timeout and fails with
// POOL_EXHAUSTED_TIMEOUT; a zero timeout polls. Released connections return
// to the idle set; a connection is never recycled with an open transaction.
//
// The descriptor's connection FSM lives here: probe failures reclassify to
// DEGRADED, recovery returns to CONNECTED, exhausted reconnects go to ERROR.

use crate::client::{
    Backend, Connection, ConnectionDescriptor, ConnectionState, ConnectionStateMachine,
    QueryRequest,
};
use crate::common::QueryResult;
use crate::concurrent::{retry_if, EventBus, RetryConfig};
use crate::error::{DbError, Result};
use crate::pool::pool_metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::vault::Vault;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

/// Whether an error (possibly wrapped by retry exhaustion) indicates the
/// connection itself is gone.
fn is_disconnect(error: &DbError) -> bool {
    match error {
        DbError::ConnectionFailed(_) => true,
        DbError::AttemptsExhausted { last, .. } => is_disconnect(last),
        _ => false,
    }
}

/// A checked-out connection. Dropping it returns the connection to the
/// pool; `discard` closes it instead (used after timeouts and fatal
/// errors). Move semantics make double release unrepresentable.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn
            .as_mut()
            .expect("connection already released")
            .as_mut()
    }

    /// Return the connection to the pool explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Close the underlying connection instead of recycling it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard_connection(conn);
        }
        self.permit.take();
        self.pool.metrics.record_release();
    }

    fn release_inner(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
            self.permit.take();
            self.pool.metrics.record_release();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Pool for one descriptor. Shared safely across callers; all internal
/// state is guarded.
pub struct ConnectionPool {
    descriptor: ConnectionDescriptor,
    backend: Arc<dyn Backend>,
    vault: Option<Arc<Vault>>,
    state: ConnectionStateMachine,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    pub metrics: PoolMetrics,
    retry: RetryConfig,
    closed: AtomicBool,
    reaper_stop: tokio::sync::watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(
        descriptor: ConnectionDescriptor,
        backend: Arc<dyn Backend>,
        vault: Option<Arc<Vault>>,
        bus: Option<Arc<EventBus>>,
        retry: RetryConfig,
    ) -> Result<Arc<Self>> {
        descriptor.validate()?;
        let (reaper_stop, reaper_rx) = tokio::sync::watch::channel(false);
        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(descriptor.pool.max_size)),
            state: ConnectionStateMachine::new(&descriptor.name, bus),
            idle: Mutex::new(VecDeque::new()),
            metrics: PoolMetrics::default(),
            retry,
            closed: AtomicBool::new(false),
            reaper_stop,
            backend,
            vault,
            descriptor,
        });
        pool.spawn_maintenance(reaper_rx);
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connections currently available without opening new ones.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Open the initial min_size connections and mark the descriptor
    /// CONNECTED.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.state.transition(ConnectionState::Connecting)?;
        for _ in 0..self.descriptor.pool.min_size {
            match self.open_connection().await {
                Ok(conn) => self.idle.lock().push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                }),
                Err(e) => {
                    self.state.fail(&format!("initial connect failed: {}", e.code()));
                    return Err(e);
                }
            }
        }
        self.state.transition(ConnectionState::Connected)?;
        Ok(())
    }

    /// Acquire a connection within `timeout` (descriptor default when
    /// `None`). A zero timeout polls and fails fast.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionFailed(format!(
                "pool '{}' is shut down",
                self.descriptor.name
            )));
        }
        let wait_budget = timeout.unwrap_or(self.descriptor.pool.acquire_timeout);
        let started = Instant::now();

        let permit = if wait_budget.is_zero() {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    self.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(DbError::PoolExhaustedTimeout(wait_budget));
                }
            }
        } else {
            match tokio::time::timeout(
                wait_budget,
                Arc::clone(&self.permits).acquire_owned(),
            )
            .await
            {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => {
                    return Err(DbError::ConnectionFailed(format!(
                        "pool '{}' is shut down",
                        self.descriptor.name
                    )))
                }
                Err(_) => {
                    self.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(DbError::PoolExhaustedTimeout(wait_budget));
                }
            }
        };

        let conn = match self.idle.lock().pop_front() {
            Some(idle) => Some(idle.conn),
            None => None,
        };
        // On connect failure the permit drops with this scope, freeing the
        // slot for the next waiter.
        let conn = match conn {
            Some(conn) => conn,
            None => self.open_connection().await?,
        };

        self.metrics
            .record_acquire(started.elapsed().as_micros() as u64);
        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(self),
        })
    }

    /// Acquire, execute with transient-error retry, release. The optional
    /// deadline bounds the driver call; on breach the connection is
    /// discarded and CANCELLED surfaces.
    ///
    /// The retry loop lives here rather than wrapping `retry_if` because
    /// each attempt needs exclusive access to the checked-out connection.
    pub async fn execute(
        self: &Arc<Self>,
        request: &QueryRequest,
        deadline: Option<Duration>,
    ) -> Result<QueryResult> {
        request.validate_for(self.descriptor.kind)?;
        let mut pooled = self.acquire(None).await?;
        let effective = deadline.or(request.timeout());

        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let conn = pooled.connection();
            let outcome = match effective {
                Some(budget) => match tokio::time::timeout(budget, conn.execute(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(DbError::Cancelled(format!(
                        "query deadline of {:?} exceeded",
                        budget
                    ))),
                },
                None => conn.execute(request).await,
            };
            match outcome {
                Ok(value) => break Ok(value),
                Err(e) if matches!(e, DbError::Cancelled(_)) => break Err(e),
                Err(e) if !e.is_retryable() => break Err(e),
                Err(e) if attempt >= self.retry.max_attempts => {
                    break Err(DbError::AttemptsExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(attempt + 1);
                    tracing::debug!(
                        pool = %self.descriptor.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient query failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match &result {
            Err(DbError::Cancelled(_)) => {
                // In-flight work may still own the wire; replace the
                // connection rather than recycling it.
                pooled.discard();
            }
            Err(e) if is_disconnect(e) => {
                self.state.fail(e.code());
                pooled.discard();
            }
            _ => pooled.release(),
        }
        result
    }

    /// Execute a DDL statement on a pooled connection.
    pub async fn execute_ddl(self: &Arc<Self>, statement: &str) -> Result<QueryResult> {
        let mut pooled = self.acquire(None).await?;
        let result = pooled.connection().execute_ddl(statement).await;
        pooled.release();
        result
    }

    /// Ping one connection; used by the health aggregator.
    pub async fn ping(self: &Arc<Self>) -> Result<Duration> {
        let mut pooled = self.acquire(None).await?;
        let result = pooled.connection().ping().await;
        match &result {
            Ok(_) => pooled.release(),
            Err(_) => pooled.discard(),
        }
        result
    }

    /// Recover from ERROR: step back through CONNECTING and re-prime
    /// min_size connections. Used by the reconnect supervisor.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionFailed(format!(
                "pool '{}' is shut down",
                self.descriptor.name
            )));
        }
        self.state.transition(ConnectionState::Connecting)?;
        self.idle.lock().clear();
        for _ in 0..self.descriptor.pool.min_size.max(1) {
            match self.open_connection().await {
                Ok(conn) => self.idle.lock().push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                }),
                Err(e) => {
                    self.state.fail(e.code());
                    return Err(e);
                }
            }
        }
        self.state.transition(ConnectionState::Connected)?;
        Ok(())
    }

    /// Drain the pool: stop maintenance, close idle connections, step the
    /// FSM down to DISCONNECTED.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.reaper_stop.send(true);
        if self.state.current().is_usable() {
            self.state.transition(ConnectionState::Disconnecting)?;
        }
        let drained: Vec<IdleConnection> = self.idle.lock().drain(..).collect();
        for mut idle in drained {
            let _ = idle.conn.close().await;
            self.metrics.closed.fetch_add(1, Ordering::Relaxed);
        }
        if self.state.current() == ConnectionState::Disconnecting {
            self.state.transition(ConnectionState::Disconnected)?;
        }
        Ok(())
    }

    /// Test hook: drive the descriptor FSM into ERROR the way a fatal
    /// driver failure would.
    #[cfg(test)]
    pub(crate) fn state_machine_fail_for_tests(&self, message: &str) {
        self.state.fail(message);
    }

    async fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let credentials = match &self.descriptor.credentials_ref {
            Some(key) => {
                let vault = self.vault.as_ref().ok_or_else(|| {
                    DbError::Configuration(format!(
                        "descriptor '{}' references vault key '{}' but no vault is attached",
                        self.descriptor.name, key
                    ))
                })?;
                Some(vault.get(key)?)
            }
            None => None,
        };
        let conn = retry_if(&self.retry, DbError::is_retryable, || {
            let credentials = credentials.as_ref();
            async move { self.backend.connect(&self.descriptor, credentials).await }
        })
        .await?;
        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn return_connection(&self, mut conn: Box<dyn Connection>) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard_connection(conn);
            return;
        }
        if conn.in_transaction() {
            // Roll the orphaned transaction back off-path; the connection
            // is dropped rather than recycled dirty.
            tokio::spawn(async move {
                let _ = conn.rollback().await;
                let _ = conn.close().await;
            });
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.idle.lock().push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    fn discard_connection(&self, mut conn: Box<dyn Connection>) {
        self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
        self.metrics.closed.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _ = conn.close().await;
        });
    }

    /// Background maintenance: probe idle connections and reap the surplus
    /// past their idle timeout.
    fn spawn_maintenance(self: &Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let pool = Arc::downgrade(self);
        let interval = self
            .descriptor
            .pool
            .probe_interval
            .min(self.descriptor.pool.idle_timeout)
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => return,
                }
                let Some(pool) = pool.upgrade() else { return };
                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }
                pool.run_maintenance().await;
            }
        });
    }

    async fn run_maintenance(self: &Arc<Self>) {
        // Reap idle surplus beyond min_size.
        let min = self.descriptor.pool.min_size;
        let idle_timeout = self.descriptor.pool.idle_timeout;
        let mut to_close = Vec::new();
        {
            let mut idle = self.idle.lock();
            while idle.len() > min {
                let stale = idle
                    .front()
                    .map(|front| front.idle_since.elapsed() >= idle_timeout)
                    .unwrap_or(false);
                if !stale {
                    break;
                }
                if let Some(conn) = idle.pop_front() {
                    to_close.push(conn);
                }
            }
        }
        for mut idle in to_close {
            let _ = idle.conn.close().await;
            self.metrics.closed.fetch_add(1, Ordering::Relaxed);
        }

        // Probe one idle connection.
        let probed = self.idle.lock().pop_front();
        if let Some(mut idle) = probed {
            match idle.conn.ping().await {
                Ok(_) => {
                    self.idle.lock().push_back(IdleConnection {
                        conn: idle.conn,
                        idle_since: idle.idle_since,
                    });
                    if self.state.current() == ConnectionState::Degraded {
                        let _ = self.state.transition(ConnectionState::Connected);
                    }
                }
                Err(e) => {
                    self.metrics.probe_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        pool = %self.descriptor.name,
                        error = %e,
                        "idle probe failed; reclassifying"
                    );
                    if self.state.current() == ConnectionState::Connected {
                        let _ = self.state.transition(ConnectionState::Degraded);
                    }
                    let _ = idle.conn.close().await;
                    self.metrics.closed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryBackend;
    use crate::client::{BackendKind, PoolParams};

    fn descriptor(max: usize, acquire_ms: u64) -> ConnectionDescriptor {
        ConnectionDescriptor::new("t", BackendKind::Postgres, "localhost", 5432, "app").with_pool(
            PoolParams {
                min_size: 1,
                max_size: max,
                acquire_timeout: Duration::from_millis(acquire_ms),
                idle_timeout: Duration::from_secs(300),
                probe_interval: Duration::from_secs(300),
            },
        )
    }

    fn test_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            factor: 2.0,
            max_delay: Duration::from_millis(20),
            jitter: None,
        }
    }

    async fn make_pool(max: usize, acquire_ms: u64) -> (Arc<ConnectionPool>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new(BackendKind::Postgres));
        let pool = ConnectionPool::new(
            descriptor(max, acquire_ms),
            Arc::clone(&backend) as Arc<dyn Backend>,
            None,
            None,
            test_retry(),
        )
        .unwrap();
        pool.initialize().await.unwrap();
        (pool, backend)
    }

    #[tokio::test]
    async fn acquire_release_restores_available() {
        let (pool, _backend) = make_pool(2, 100).await;
        assert_eq!(pool.available(), 2);
        let conn = pool.acquire(None).await.unwrap();
        assert_eq!(pool.available(), 1);
        conn.release();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn zero_timeout_polls() {
        let (pool, _backend) = make_pool(1, 100).await;
        let held = pool.acquire(None).await.unwrap();
        let err = pool.acquire(Some(Duration::ZERO)).await.unwrap_err();
        assert_eq!(err.code(), "POOL_EXHAUSTED_TIMEOUT");
        held.release();
        pool.acquire(Some(Duration::ZERO)).await.unwrap().release();
    }

    #[tokio::test]
    async fn outstanding_never_exceeds_max() {
        let (pool, backend) = make_pool(2, 50).await;
        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        let err = pool.acquire(None).await.unwrap_err();
        assert_eq!(err.code(), "POOL_EXHAUSTED_TIMEOUT");
        a.release();
        b.release();
        // Only two connections were ever opened.
        assert!(backend.server().connect_count() <= 2);
    }

    #[tokio::test]
    async fn execute_retries_transient_errors() {
        let (pool, backend) = make_pool(2, 100).await;
        backend.server().fail_next_execute("40P01", 2);
        let result = pool
            .execute(&QueryRequest::sql("SELECT 1"), None)
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn open_transaction_never_recycled() {
        let (pool, _backend) = make_pool(1, 100).await;
        let mut conn = pool.acquire(None).await.unwrap();
        conn.connection().begin().await.unwrap();
        conn.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The dirty connection was dropped, so a fresh acquire opens anew.
        let mut fresh = pool.acquire(None).await.unwrap();
        assert!(!fresh.connection().in_transaction());
        fresh.release();
    }

    #[tokio::test]
    async fn deadline_breach_surfaces_cancelled() {
        let (pool, _backend) = make_pool(1, 100).await;
        let err = pool
            .execute(
                &QueryRequest::sql("SELECT pg_sleep(5)"),
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        // The pool replaced the connection and stays usable.
        pool.execute(&QueryRequest::sql("SELECT 1"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_steps_fsm_down() {
        let (pool, _backend) = make_pool(2, 100).await;
        assert_eq!(pool.state(), ConnectionState::Connected);
        pool.shutdown().await.unwrap();
        assert_eq!(pool.state(), ConnectionState::Disconnected);
        assert!(pool.acquire(None).await.is_err());
    }
}
