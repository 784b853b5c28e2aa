// # Semantic Cache
//
// Fingerprint-keyed artifact cache with the at-most-one-build guarantee,
// LRU + TTL eviction, transparent compression, and an optional external
// store behind the GET/SET/DEL/EXPIRE/DBSIZE interface. Cache failures
// never block correctness: unreachable stores fall through to the builder.

pub mod semantic_cache;
pub mod store;

pub use semantic_cache::{fingerprint, CacheConfig, CacheStatistics, SemanticCache};
pub use store::{ExternalStore, KvPoolStore};
