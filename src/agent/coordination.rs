// # Cross-Agent Coordination
//
// A distributed-lock abstraction keyed by resource name: owner token, TTL,
// auto-release on holder failure (expiry). The store is pluggable; the
// in-process store serves single-node deployments and tests, and the KV
// store rides on any registered key-value backend.

use crate::client::{KvOperation, QueryRequest};
use crate::common::Value;
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pluggable lock backend.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to take `key` for `owner` with a TTL. Returns false when held
    /// by a live owner.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if `owner` still holds it. Returns whether anything
    /// was released.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;
}

/// Single-process store with TTL expiry.
#[derive(Default)]
pub struct InProcessLockStore {
    locks: DashMap<String, (String, Instant)>,
}

impl InProcessLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InProcessLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut taken = false;
        self.locks
            .entry(key.to_string())
            .and_modify(|(held_by, expires)| {
                if *expires <= now || held_by == owner {
                    *held_by = owner.to_string();
                    *expires = now + ttl;
                    taken = true;
                }
            })
            .or_insert_with(|| {
                taken = true;
                (owner.to_string(), now + ttl)
            });
        Ok(taken)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let removed = self
            .locks
            .remove_if(key, |_, (held_by, _)| held_by == owner)
            .is_some();
        Ok(removed)
    }
}

/// Lock store backed by a registered key-value backend. Keys are namespaced
/// under `steward:lock:`; the backend's TTL provides auto-release.
pub struct KvLockStore {
    pool: Arc<ConnectionPool>,
}

impl KvLockStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn lock_key(key: &str) -> String {
        format!("steward:lock:{}", key)
    }
}

#[async_trait]
impl LockStore for KvLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let lock_key = Self::lock_key(key);
        let current = self
            .pool
            .execute(&QueryRequest::KeyValue(KvOperation::Get { key: lock_key.clone() }), None)
            .await?;
        match current.rows.first().and_then(|r| r.first()) {
            Some(Value::Text(held_by)) if held_by != owner => return Ok(false),
            _ => {}
        }
        self.pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Set {
                    key: lock_key,
                    value: owner.to_string(),
                    ttl: Some(ttl.as_secs().max(1)),
                }),
                None,
            )
            .await?;
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let lock_key = Self::lock_key(key);
        let current = self
            .pool
            .execute(&QueryRequest::KeyValue(KvOperation::Get { key: lock_key.clone() }), None)
            .await?;
        match current.rows.first().and_then(|r| r.first()) {
            Some(Value::Text(held_by)) if held_by == owner => {
                self.pool
                    .execute(&QueryRequest::KeyValue(KvOperation::Del { key: lock_key }), None)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A held lock. Release explicitly; dropping releases best-effort.
pub struct LockGuard {
    key: String,
    owner: String,
    store: Arc<dyn LockStore>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release(&self.key, &self.owner).await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let store = Arc::clone(&self.store);
            let key = self.key.clone();
            let owner = self.owner.clone();
            tokio::spawn(async move {
                let _ = store.release(&key, &owner).await;
            });
        }
    }
}

/// Acquisition front end with polling waits.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Acquire `key` within `wait`, holding it for `ttl`. Fails with
    /// LOCK_HELD when the wait budget runs out.
    pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Result<LockGuard> {
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if self.store.try_acquire(key, &owner, ttl).await? {
                return Ok(LockGuard {
                    key: key.to_string(),
                    owner,
                    store: Arc::clone(&self.store),
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(DbError::LockHeld(key.to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_until_released() {
        let manager = LockManager::new(Arc::new(InProcessLockStore::new()));
        let guard = manager
            .acquire("migration:prod", Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
        let err = manager
            .acquire("migration:prod", Duration::from_secs(10), Duration::from_millis(60))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_HELD");

        guard.release().await.unwrap();
        manager
            .acquire("migration:prod", Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ttl_expiry_auto_releases() {
        let manager = LockManager::new(Arc::new(InProcessLockStore::new()));
        let _held = manager
            .acquire("res", Duration::from_millis(30), Duration::ZERO)
            .await
            .unwrap();
        // The first holder's TTL lapses; a second owner may take over.
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager
            .acquire("res", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kv_backed_store() {
        use crate::client::memory::MemoryBackend;
        use crate::client::{Backend, BackendKind, ConnectionDescriptor};
        use crate::concurrent::RetryConfig;

        let backend = Arc::new(MemoryBackend::new(BackendKind::Redis));
        let pool = crate::pool::ConnectionPool::new(
            ConnectionDescriptor::new("kv", BackendKind::Redis, "localhost", 6379, "0"),
            backend as Arc<dyn Backend>,
            None,
            None,
            RetryConfig::default(),
        )
        .unwrap();
        pool.initialize().await.unwrap();

        let store = Arc::new(KvLockStore::new(pool));
        let manager = LockManager::new(store);
        let guard = manager
            .acquire("res", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        assert!(manager
            .acquire("res", Duration::from_secs(5), Duration::ZERO)
            .await
            .is_err());
        guard.release().await.unwrap();
        manager
            .acquire("res", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
    }
}
