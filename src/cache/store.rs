// # External Cache Store Interface
//
// The pluggable second tier: GET/SET/DEL/EXPIRE/DBSIZE. The KV-pool
// implementation rides on any registered key-value backend; store failures
// are reported as CACHE_UNAVAILABLE so the cache can bypass them.

use crate::client::{KvOperation, QueryRequest};
use crate::common::Value;
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ExternalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn dbsize(&self) -> Result<u64>;
}

/// External store over a key-value pool. Values are base64-wrapped since
/// the KV wire form is string-typed.
pub struct KvPoolStore {
    pool: Arc<ConnectionPool>,
    namespace: String,
}

impl KvPoolStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            namespace: "steward:cache:".to_string(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn unavailable(e: DbError) -> DbError {
        DbError::CacheUnavailable(e.to_string())
    }
}

#[async_trait]
impl ExternalStore for KvPoolStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Get {
                    key: self.namespaced(key),
                }),
                None,
            )
            .await
            .map_err(Self::unavailable)?;
        match result.rows.first().and_then(|r| r.first()) {
            Some(Value::Text(encoded)) => {
                let bytes = B64
                    .decode(encoded)
                    .map_err(|e| DbError::CacheUnavailable(format!("corrupt entry: {}", e)))?;
                Ok(Some(bytes))
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Set {
                    key: self.namespaced(key),
                    value: B64.encode(value),
                    ttl: ttl.map(|t| t.as_secs().max(1)),
                }),
                None,
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Del {
                    key: self.namespaced(key),
                }),
                None,
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Expire {
                    key: self.namespaced(key),
                    ttl: ttl.as_secs().max(1),
                }),
                None,
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn dbsize(&self) -> Result<u64> {
        let result = self
            .pool
            .execute(
                &QueryRequest::KeyValue(KvOperation::Keys {
                    pattern: format!("{}*", self.namespace),
                }),
                None,
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(result.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryBackend;
    use crate::client::{Backend, BackendKind, ConnectionDescriptor};
    use crate::concurrent::RetryConfig;

    async fn store() -> KvPoolStore {
        let backend = Arc::new(MemoryBackend::new(BackendKind::Redis));
        let pool = ConnectionPool::new(
            ConnectionDescriptor::new("kv", BackendKind::Redis, "localhost", 6379, "0"),
            backend as Arc<dyn Backend>,
            None,
            None,
            RetryConfig::default(),
        )
        .unwrap();
        pool.initialize().await.unwrap();
        KvPoolStore::new(pool)
    }

    #[tokio::test]
    async fn roundtrip_and_delete() {
        let s = store().await;
        assert!(s.get("k").await.unwrap().is_none());
        s.set("k", b"\x00binary\xff", None).await.unwrap();
        assert_eq!(s.get("k").await.unwrap().unwrap(), b"\x00binary\xff");
        assert_eq!(s.dbsize().await.unwrap(), 1);
        s.del("k").await.unwrap();
        assert!(s.get("k").await.unwrap().is_none());
    }
}
