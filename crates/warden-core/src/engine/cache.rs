use std::time::Duration;

use moka::future::Cache;

use crate::schema::SchemaVersion;
use crate::tuple::{ObjectRef, Revision, SubjectRef};

#[derive(Debug, Clone)]
pub struct CheckCacheConfig {
    pub max_capacity: u64,
    pub ttl: Duration,
}

impl Default for CheckCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub schema_version: SchemaVersion,
    pub revision: Revision,
    pub object: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
}

/// Cross-query cache of check results, keyed by schema version and store
/// revision. Snapshots are immutable, so entries live until capacity or TTL
/// evicts them and writes need no invalidation.
#[derive(Clone)]
pub struct CheckCache {
    cache: Cache<CacheKey, bool>,
}

impl CheckCache {
    pub fn new(config: &CheckCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();
        Self { cache }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<bool> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: CacheKey, allowed: bool) {
        self.cache.insert(key, allowed).await;
    }

    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for CheckCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
