// # Semantic Cache Core
//
// Fingerprint derivation plus the in-process tier: LRU + TTL, transparent
// compression above a size threshold, and the dogpile guarantee: for any
// key, at most one builder runs between the first miss and publication;
// concurrent waiters share the single result.
//
// An embedding-based similarity key can replace the canonical fingerprint;
// the cache treats keys as opaque strings either way.

use crate::cache::store::ExternalStore;
use crate::common::Value;
use crate::concurrent::{topics, EventBus};
use crate::error::{DbError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Derive the canonical fingerprint for a query against a connection.
/// Canonicalization: collapse whitespace and lowercase everything outside
/// single-quoted strings (keywords and identifiers fold; literals do not).
/// Clause reordering is deliberately not attempted.
pub fn fingerprint(query: &str, connection: &str, params: &[Value]) -> String {
    let mut canonical = String::with_capacity(query.len());
    let mut in_string = false;
    let mut last_space = true;
    for c in query.trim().chars() {
        if c == '\'' {
            in_string = !in_string;
            canonical.push(c);
            last_space = false;
        } else if in_string {
            canonical.push(c);
            last_space = false;
        } else if c.is_whitespace() {
            if !last_space {
                canonical.push(' ');
                last_space = true;
            }
        } else {
            for lowered in c.to_lowercase() {
                canonical.push(lowered);
            }
            last_space = false;
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(canonical.trim_end().as_bytes());
    hasher.update([0x1f]);
    hasher.update(connection.as_bytes());
    hasher.update([0x1f]);
    for param in params {
        hasher.update(param.to_string().as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the in-process tier
    pub max_entries: usize,

    /// Maximum stored bytes in the in-process tier
    pub max_bytes: usize,

    /// TTL when the caller does not supply one
    pub default_ttl: Duration,

    /// Artifacts at or above this size are compressed
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 256 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            compression_threshold: 4 * 1024,
        }
    }
}

struct Entry {
    data: Vec<u8>,
    compressed: bool,
    original_size: usize,
    created: Instant,
    ttl: Duration,
    /// Connection tag for targeted invalidation
    tag: Option<String>,
    hits: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

struct CacheState {
    entries: HashMap<String, Entry>,
    lru: VecDeque<String>,
    building: HashMap<String, Arc<Notify>>,
    stored_bytes: usize,
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub stored_bytes: usize,
    pub original_bytes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub store_errors: u64,
    /// original/stored across compressed entries; 1.0 when nothing is
    /// compressed
    pub compression_ratio: f64,
}

/// The cache. Shared as `Arc<SemanticCache>`.
pub struct SemanticCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    external: Option<Arc<dyn ExternalStore>>,
    bus: Option<Arc<EventBus>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    store_errors: AtomicU64,
    original_bytes: AtomicU64,
}

impl SemanticCache {
    pub fn new(
        config: CacheConfig,
        external: Option<Arc<dyn ExternalStore>>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
                building: HashMap::new(),
                stored_bytes: 0,
            }),
            external,
            bus,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            original_bytes: AtomicU64::new(0),
        }
    }

    /// Fetch the artifact for `key`, building it at most once across all
    /// concurrent callers. Waiters share the builder's result; a failed
    /// build releases the key so the next caller may try again.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tag: Option<&str>,
        builder: F,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut builder = Some(builder);

        loop {
            // Fast path under the lock: fresh hit or in-flight build.
            let waiter: Option<Arc<Notify>> = {
                let mut state = self.state.lock();
                match state.entries.get_mut(key) {
                    Some(entry) if !entry.is_expired() => {
                        entry.hits += 1;
                        let artifact = decompress(&entry.data, entry.compressed)?;
                        touch_lru(&mut state.lru, key);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(artifact);
                    }
                    Some(_) => {
                        self.expired.fetch_add(1, Ordering::Relaxed);
                        remove_entry(&mut state, key);
                    }
                    None => {}
                }
                match state.building.get(key) {
                    Some(notify) => Some(Arc::clone(notify)),
                    None => {
                        state
                            .building
                            .insert(key.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            if let Some(notify) = waiter {
                let notified = notify.notified();
                tokio::pin!(notified);
                // Register interest before re-checking, otherwise a
                // builder finishing in this gap would wake nobody.
                notified.as_mut().enable();
                if self.state.lock().building.contains_key(key) {
                    notified.await;
                }
                continue;
            }

            // This caller is the designated builder.
            self.misses.fetch_add(1, Ordering::Relaxed);
            let built = self.build(key, ttl, tag, builder.take()).await;
            let notify = {
                let mut state = self.state.lock();
                state.building.remove(key)
            };
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            return built;
        }
    }

    async fn build<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tag: Option<&str>,
        builder: Option<F>,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        // Second tier first; store failures fall through to the builder.
        if let Some(store) = &self.external {
            match store.get(key).await {
                Ok(Some(artifact)) => {
                    self.insert_local(key, &artifact, ttl, tag)?;
                    return Ok(artifact);
                }
                Ok(None) => {}
                Err(e) => {
                    self.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "external cache store unreachable; bypassing");
                }
            }
        }

        let builder = builder
            .ok_or_else(|| DbError::InvariantViolated("builder consumed twice".to_string()))?;
        let artifact = builder().await?;

        self.insert_local(key, &artifact, ttl, tag)?;
        if let Some(store) = &self.external {
            if let Err(e) = store.set(key, &artifact, Some(ttl)).await {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "external cache store write failed");
            }
        }
        Ok(artifact)
    }

    fn insert_local(&self, key: &str, artifact: &[u8], ttl: Duration, tag: Option<&str>) -> Result<()> {
        let (data, compressed) = if artifact.len() >= self.config.compression_threshold {
            (compress(artifact)?, true)
        } else {
            (artifact.to_vec(), false)
        };
        self.original_bytes
            .fetch_add(artifact.len() as u64, Ordering::Relaxed);

        let mut state = self.state.lock();
        remove_entry(&mut state, key);
        state.stored_bytes += data.len();
        state.entries.insert(
            key.to_string(),
            Entry {
                data,
                compressed,
                original_size: artifact.len(),
                created: Instant::now(),
                ttl,
                tag: tag.map(str::to_string),
                hits: 0,
            },
        );
        state.lru.push_back(key.to_string());

        // LRU eviction to both bounds.
        while state.entries.len() > self.config.max_entries
            || state.stored_bytes > self.config.max_bytes
        {
            let Some(victim) = state.lru.front().cloned() else {
                break;
            };
            if victim == key && state.entries.len() == 1 {
                break;
            }
            remove_entry(&mut state, &victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drop one key. Publishes `cache.invalidate`.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        remove_entry(&mut state, key);
        drop(state);
        self.publish_invalidate(serde_json::json!({ "key": key }));
    }

    /// Drop every entry tagged with a connection identity; used when a
    /// descriptor is unregistered or its topology changes.
    pub fn invalidate_tag(&self, tag: &str) {
        let victims: Vec<String> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.tag.as_deref() == Some(tag))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut state = self.state.lock();
        for key in &victims {
            remove_entry(&mut state, key);
        }
        drop(state);
        self.publish_invalidate(serde_json::json!({ "tag": tag, "count": victims.len() }));
    }

    fn publish_invalidate(&self, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.emit(topics::CACHE_INVALIDATE, "cache", payload);
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock();
        let compressed_original: u64 = state
            .entries
            .values()
            .filter(|e| e.compressed)
            .map(|e| e.original_size as u64)
            .sum();
        let compressed_stored: u64 = state
            .entries
            .values()
            .filter(|e| e.compressed)
            .map(|e| e.data.len() as u64)
            .sum();
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.entries.len(),
            stored_bytes: state.stored_bytes,
            original_bytes: self.original_bytes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            compression_ratio: if compressed_stored > 0 {
                compressed_original as f64 / compressed_stored as f64
            } else {
                1.0
            },
        }
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
    }
    lru.push_back(key.to_string());
}

fn remove_entry(state: &mut CacheState, key: &str) {
    if let Some(entry) = state.entries.remove(key) {
        state.stored_bytes = state.stored_bytes.saturating_sub(entry.data.len());
    }
    if let Some(pos) = state.lru.iter().position(|k| k == key) {
        state.lru.remove(pos);
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if !compressed {
        return Ok(data.to_vec());
    }
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn cache(config: CacheConfig) -> SemanticCache {
        SemanticCache::new(config, None, None)
    }

    #[test]
    fn fingerprint_canonicalizes() {
        let a = fingerprint("SELECT  *   FROM Users\nWHERE id = 1", "prod", &[]);
        let b = fingerprint("select * from users where id = 1", "prod", &[]);
        assert_eq!(a, b);
        // String literals keep their case.
        let c = fingerprint("SELECT * FROM t WHERE name = 'Ada'", "prod", &[]);
        let d = fingerprint("SELECT * FROM t WHERE name = 'ada'", "prod", &[]);
        assert_ne!(c, d);
        // Connection identity and params are part of the key.
        assert_ne!(
            fingerprint("SELECT 1", "prod", &[]),
            fingerprint("SELECT 1", "staging", &[])
        );
        assert_ne!(
            fingerprint("SELECT ?", "prod", &[Value::Int(1)]),
            fingerprint("SELECT ?", "prod", &[Value::Int(2)])
        );
    }

    #[tokio::test]
    async fn dogpile_builder_runs_exactly_once() {
        let cache = Arc::new(cache(CacheConfig::default()));
        let builds = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", Some(Duration::from_secs(5)), None, || {
                        let builds = Arc::clone(&builds);
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(b"artifact".to_vec())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), b"artifact");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        // A subsequent call within TTL is a pure hit.
        cache
            .get_or_compute("k", Some(Duration::from_secs(5)), None, || async {
                panic!("builder must not run on a hit")
            })
            .await
            .unwrap();
        assert!(cache.statistics().hits >= 50);
    }

    #[tokio::test]
    async fn failed_build_releases_the_key() {
        let cache = cache(CacheConfig::default());
        let err = cache
            .get_or_compute("k", None, None, || async {
                Err(DbError::QueryFailed {
                    context: crate::error::ErrorContext::new("t", "q", "r"),
                    message: "boom".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUERY_FAILED");

        // The next caller becomes the builder and succeeds.
        let artifact = cache
            .get_or_compute("k", None, None, || async { Ok(b"second".to_vec()) })
            .await
            .unwrap();
        assert_eq!(artifact, b"second");
    }

    #[tokio::test]
    async fn ttl_expiry_rebuilds() {
        let cache = cache(CacheConfig::default());
        cache
            .get_or_compute("k", Some(Duration::from_millis(20)), None, || async {
                Ok(b"v1".to_vec())
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let v2 = cache
            .get_or_compute("k", Some(Duration::from_secs(5)), None, || async {
                Ok(b"v2".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(v2, b"v2");
        assert_eq!(cache.statistics().expired, 1);
    }

    #[tokio::test]
    async fn lru_eviction_respects_bounds() {
        let cache = cache(CacheConfig {
            max_entries: 2,
            max_bytes: 1024 * 1024,
            default_ttl: Duration::from_secs(60),
            compression_threshold: 1024 * 1024,
        });
        for key in ["a", "b", "c"] {
            cache
                .get_or_compute(key, None, None, || async { Ok(vec![0u8; 16]) })
                .await
                .unwrap();
        }
        let stats = cache.statistics();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn compression_is_transparent() {
        let cache = cache(CacheConfig {
            compression_threshold: 64,
            ..Default::default()
        });
        let artifact = vec![b'x'; 10_000];
        let expected = artifact.clone();
        let out = cache
            .get_or_compute("big", None, None, move || async move { Ok(artifact) })
            .await
            .unwrap();
        assert_eq!(out, expected);

        // Read back decompresses.
        let again = cache
            .get_or_compute("big", None, None, || async { unreachable!() })
            .await
            .unwrap();
        assert_eq!(again, expected);

        let stats = cache.statistics();
        assert!(stats.stored_bytes < 10_000);
        assert!(stats.compression_ratio > 10.0);
    }

    #[tokio::test]
    async fn tag_invalidation() {
        let cache = cache(CacheConfig::default());
        cache
            .get_or_compute("q1", None, Some("prod"), || async { Ok(b"a".to_vec()) })
            .await
            .unwrap();
        cache
            .get_or_compute("q2", None, Some("staging"), || async { Ok(b"b".to_vec()) })
            .await
            .unwrap();
        cache.invalidate_tag("prod");
        let stats = cache.statistics();
        assert_eq!(stats.entries, 1);
    }
}
