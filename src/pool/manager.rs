// # Pool Manager
//
// Registry of per-descriptor pools plus the backend driver factories they
// connect through. Descriptors are owned here from `register` until
// `unregister`; connections inside are owned by their pool.

use crate::client::{Backend, BackendKind, ConnectionDescriptor};
use crate::client::memory::MemoryBackend;
use crate::common::Component;
use crate::concurrent::{EventBus, RetryConfig};
use crate::error::{DbError, Result};
use crate::pool::connection_pool::ConnectionPool;
use crate::pool::pool_metrics::PoolMetricsSnapshot;
use crate::vault::Vault;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Owns every registered descriptor and its pool.
pub struct PoolManager {
    backends: DashMap<BackendKind, Arc<dyn Backend>>,
    pools: DashMap<String, Arc<ConnectionPool>>,
    registration_order: Mutex<Vec<String>>,
    vault: Option<Arc<Vault>>,
    bus: Option<Arc<EventBus>>,
    retry: RetryConfig,
}

impl PoolManager {
    pub fn new(
        vault: Option<Arc<Vault>>,
        bus: Option<Arc<EventBus>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backends: DashMap::new(),
            pools: DashMap::new(),
            registration_order: Mutex::new(Vec::new()),
            vault,
            bus,
            retry,
        }
    }

    /// Manager wired with the in-memory reference driver for every backend
    /// kind. Adapter crates replace these per kind in production.
    pub fn with_memory_backends(
        vault: Option<Arc<Vault>>,
        bus: Option<Arc<EventBus>>,
        retry: RetryConfig,
    ) -> Self {
        let manager = Self::new(vault, bus, retry);
        for kind in [
            BackendKind::Postgres,
            BackendKind::Mysql,
            BackendKind::Oracle,
            BackendKind::Sqlite,
            BackendKind::Mongo,
            BackendKind::Redis,
            BackendKind::Cassandra,
            BackendKind::Dynamo,
            BackendKind::Neo4j,
        ] {
            manager.register_backend(Arc::new(MemoryBackend::new(kind)));
        }
        manager
    }

    /// Install a driver factory for a backend kind, replacing any previous.
    pub fn register_backend(&self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Register a descriptor and open its pool (priming min_size
    /// connections). Fails with ALREADY_EXISTS on a name conflict.
    pub async fn register(&self, descriptor: ConnectionDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.pools.contains_key(&descriptor.name) {
            return Err(DbError::AlreadyExists(format!(
                "connection '{}'",
                descriptor.name
            )));
        }
        let backend = self
            .backends
            .get(&descriptor.kind)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| {
                DbError::Configuration(format!(
                    "no driver registered for backend kind '{}'",
                    descriptor.kind
                ))
            })?;
        let name = descriptor.name.clone();
        let pool = ConnectionPool::new(
            descriptor,
            backend,
            self.vault.clone(),
            self.bus.clone(),
            self.retry.clone(),
        )?;
        pool.initialize().await?;
        self.pools.insert(name.clone(), pool);
        self.registration_order.lock().push(name.clone());
        tracing::info!(connection = %name, "connection registered");
        Ok(())
    }

    /// Drain and remove a pool. Idempotent: unknown names are a no-op.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        if let Some((_, pool)) = self.pools.remove(name) {
            pool.shutdown().await?;
            self.registration_order.lock().retain(|n| n != name);
            tracing::info!(connection = %name, "connection unregistered");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        self.pools
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| DbError::NotFound(format!("connection '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Registered connection names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registration_order.lock().clone()
    }

    pub fn metrics(&self) -> HashMap<String, PoolMetricsSnapshot> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics_snapshot()))
            .collect()
    }

    /// Drain every pool in reverse registration order.
    pub async fn shutdown_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let mut order = self.registration_order.lock().clone();
            order.reverse();
            order
        };
        for name in names {
            if let Some((_, pool)) = self.pools.remove(&name) {
                pool.shutdown().await?;
            }
        }
        self.registration_order.lock().clear();
        Ok(())
    }
}

#[async_trait]
impl Component for PoolManager {
    fn name(&self) -> &str {
        "pool-manager"
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_all().await
    }
}
