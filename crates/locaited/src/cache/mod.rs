//! Cache Store
//!
//! Content-addressed, namespaced store for external call results. Keys are
//! digests of canonicalized semantic inputs; values are immutable once stored.
//! An optional [`DiskStore`] keeps entries across processes.

pub mod disk;

use std::{
    collections::BTreeMap,
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use moka::{future::Cache, Expiry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use disk::DiskStore;

use crate::{config::CacheConfig, ledger::CallUsage, Result};

/// Logical partition of the cache, one per kind of external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Profile,
    Leads,
    Verify,
    Search,
    Events,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Profile,
        Namespace::Leads,
        Namespace::Verify,
        Namespace::Search,
        Namespace::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Profile => "profile",
            Namespace::Leads => "leads",
            Namespace::Verify => "verify",
            Namespace::Search => "search",
            Namespace::Events => "events",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-case, trim and collapse internal whitespace
pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Order-independent description of the semantic inputs of one external call.
///
/// Two calls with the same semantic inputs produce the same digest no matter
/// the order fields were added in, the order of set members, or differences
/// in case and whitespace of text fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalKey {
    fields: BTreeMap<String, serde_json::Value>,
}

impl CanonicalKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Free text, normalized
    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.fields
            .insert(name.to_string(), serde_json::Value::String(normalize_text(value)));
        self
    }

    pub fn opt_text(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) if !value.trim().is_empty() => self.text(name, value),
            _ => self,
        }
    }

    /// Unordered collection of text values; normalized, sorted and de-duplicated
    pub fn set<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = values
            .into_iter()
            .map(|v| normalize_text(v.as_ref()))
            .filter(|v| !v.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();
        self.fields
            .insert(name.to_string(), serde_json::json!(normalized));
        self
    }

    pub fn int(mut self, name: &str, value: i64) -> Self {
        self.fields.insert(name.to_string(), serde_json::json!(value));
        self
    }

    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.fields.insert(name.to_string(), serde_json::json!(value));
        self
    }

    /// Structured value; object keys are sorted recursively, arrays keep order
    pub fn value(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.insert(name.to_string(), sort_keys(value));
        self
    }

    /// Stable serialization of the key (sorted field names)
    pub fn canonical_json(&self) -> String {
        // BTreeMap<String, Value> serializes in key order; nested objects were
        // already sorted on insertion.
        serde_json::to_string(&self.fields).unwrap_or_default()
    }

    /// Hex SHA-256 of the canonical serialization
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

/// Cache key: namespace plus content digest
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    namespace: Namespace,
    digest: String,
}

impl CacheKey {
    pub fn new(namespace: Namespace, key: &CanonicalKey) -> Self {
        Self {
            namespace,
            digest: key.digest(),
        }
    }

    fn from_digest(namespace: Namespace, digest: String) -> Self {
        Self { namespace, digest }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Result of one external call as stored in the cache. Never mutated after insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedValue {
    /// Validated structured payload
    pub payload: serde_json::Value,
    /// What the original computation cost
    pub usage: CallUsage,
    pub cached_at: DateTime<Utc>,
}

impl CachedValue {
    pub fn new(payload: serde_json::Value, usage: CallUsage) -> Self {
        Self {
            payload,
            usage,
            cached_at: Utc::now(),
        }
    }

    /// Time left before an entry of this age outlives `ttl`
    pub fn remaining_ttl(&self, ttl: Duration) -> Duration {
        let age = (Utc::now() - self.cached_at).to_std().unwrap_or_default();
        ttl.saturating_sub(age)
    }
}

/// Expire entries `ttl` after they were first computed, so entries loaded
/// from disk keep their original deadline
struct ComputedAtExpiry {
    ttl: Duration,
}

impl Expiry<CacheKey, Arc<CachedValue>> for ComputedAtExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<CachedValue>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining_ttl(self.ttl))
    }
}

/// Content-addressed store for external call results
#[derive(Debug)]
pub struct CacheStore {
    cache: Cache<CacheKey, Arc<CachedValue>>,
    ttl: Duration,
    disk: Option<DiskStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Build the store from configuration. With `persist` set, unexpired
    /// entries under `directory` are loaded and every new entry is written
    /// back.
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let mut store = Self::with_limits(config.max_capacity, config.ttl_secs);
        if !config.persist {
            return Ok(store);
        }

        let disk = DiskStore::open(&config.directory).await?;
        let entries = disk.load(store.ttl).await?;
        let loaded = entries.len();
        for (key, value) in entries {
            store.cache.insert(key, Arc::new(value)).await;
        }
        tracing::info!(
            "[CACHE] Loaded {} entries from {}",
            loaded,
            disk.root().display()
        );

        store.disk = Some(disk);
        Ok(store)
    }

    /// In-memory store only
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of entries to cache
    /// * `ttl_seconds` - Time-to-live in seconds for cache entries
    pub fn with_limits(max_capacity: u64, ttl_seconds: u64) -> Self {
        let ttl = Duration::from_secs(ttl_seconds);
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(ComputedAtExpiry { ttl })
            .build();

        Self {
            cache,
            ttl,
            disk: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Directory backing the store, if any
    pub fn directory(&self) -> Option<&Path> {
        self.disk.as_ref().map(DiskStore::root)
    }

    /// Return the stored value for `key`, or run `compute` and store its result.
    ///
    /// At most one computation per key is in flight; concurrent callers for
    /// the same key wait for it and observe `was_hit == true`. A failed
    /// computation is not stored, and every waiter receives the error. If the
    /// computing future is dropped, nothing is written and a later caller
    /// computes again.
    pub async fn get_or_compute<F, E>(
        &self,
        namespace: Namespace,
        key: &CanonicalKey,
        compute: F,
    ) -> std::result::Result<(Arc<CachedValue>, bool), E>
    where
        F: Future<Output = std::result::Result<CachedValue, E>>,
        E: Clone + Send + Sync + 'static,
    {
        let cache_key = CacheKey::new(namespace, key);

        let entry = self
            .cache
            .entry(cache_key.clone())
            .or_try_insert_with(async move { compute.await.map(Arc::new) })
            .await
            .map_err(|err: Arc<E>| (*err).clone())?;

        let was_hit = !entry.is_fresh();
        if was_hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[CACHE] hit {}:{}",
                namespace,
                &cache_key.digest()[..16]
            );
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[CACHE] stored {}:{}",
                namespace,
                &cache_key.digest()[..16]
            );
            if let Some(disk) = &self.disk {
                if let Err(err) = disk.write(&cache_key, entry.value()).await {
                    tracing::warn!(
                        "[CACHE] Failed to persist {}:{}: {}",
                        namespace,
                        &cache_key.digest()[..16],
                        err
                    );
                }
            }
        }

        Ok((entry.into_value(), was_hit))
    }

    /// Look up a value without computing or touching hit statistics
    pub async fn peek(&self, namespace: Namespace, key: &CanonicalKey) -> Option<Arc<CachedValue>> {
        self.cache.get(&CacheKey::new(namespace, key)).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            entry_count: self.cache.entry_count(),
            hits,
            misses,
            hit_rate,
        }
    }

    /// Drop expired entries (in memory and on disk) and settle the entry count
    pub async fn purge_expired(&self) -> Result<()> {
        self.cache.run_pending_tasks().await;
        if let Some(disk) = &self.disk {
            let removed = disk.purge_expired(self.ttl).await?;
            tracing::debug!("[CACHE] Removed {} expired files", removed);
        }
        Ok(())
    }

    /// Clear all cache entries, including persisted ones
    pub async fn invalidate_all(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        if let Some(disk) = &self.disk {
            disk.clear().await?;
        }
        tracing::info!("[CACHE] Cleared all entries");
        Ok(())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn value(text: &str) -> CachedValue {
        CachedValue::new(serde_json::json!({ "text": text }), CallUsage::default())
    }

    #[test]
    fn test_canonical_key_ignores_order_case_and_whitespace() {
        let a = CanonicalKey::new()
            .text("location", "New York  City")
            .set("interests", ["Protests", "climate"])
            .int("days", 7);
        let b = CanonicalKey::new()
            .int("days", 7)
            .set("interests", ["CLIMATE", "protests", "climate"])
            .text("location", "  new york city ");

        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_canonical_key_distinguishes_semantic_inputs() {
        let a = CanonicalKey::new().text("location", "NYC").int("days", 7);
        let b = CanonicalKey::new().text("location", "NYC").int("days", 14);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_nested_values_are_sorted() {
        let a = CanonicalKey::new().value("v", serde_json::json!({ "b": 1, "a": { "d": 2, "c": 3 } }));
        let b = CanonicalKey::new().value("v", serde_json::json!({ "a": { "c": 3, "d": 2 }, "b": 1 }));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_namespaces_partition_keys() {
        let key = CanonicalKey::new().text("query", "climate march");
        assert_ne!(
            CacheKey::new(Namespace::Search, &key),
            CacheKey::new(Namespace::Leads, &key)
        );
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_hit() {
        let store = CacheStore::with_limits(10, 60);
        let key = CanonicalKey::new().text("query", "climate");
        let calls = AtomicUsize::new(0);

        let (first, hit) = store
            .get_or_compute(Namespace::Search, &key, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(value("first"))
            })
            .await
            .unwrap();
        assert!(!hit);

        let (second, hit) = store
            .get_or_compute(Namespace::Search, &key, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(value("second"))
            })
            .await
            .unwrap();
        assert!(hit);
        assert_eq!(first.payload, second.payload);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let store = CacheStore::with_limits(10, 60);
        let key = CanonicalKey::new().text("query", "flaky");

        let result = store
            .get_or_compute(Namespace::Search, &key, async {
                Err::<CachedValue, String>("upstream 503".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "upstream 503");
        assert!(store.peek(Namespace::Search, &key).await.is_none());

        let (_, hit) = store
            .get_or_compute(Namespace::Search, &key, async { Ok::<_, String>(value("ok")) })
            .await
            .unwrap();
        assert!(!hit);
        assert!(store.peek(Namespace::Search, &key).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_requests_compute_once() {
        let store = Arc::new(CacheStore::with_limits(10, 60));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CanonicalKey::new().text("query", "shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_compute(Namespace::Search, &key, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(value("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut misses = 0;
        for handle in handles {
            let (value, hit) = handle.await.unwrap();
            assert_eq!(value.payload["text"], "shared");
            if !hit {
                misses += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let store = CacheStore::with_limits(10, 60);
        let key = CanonicalKey::new().text("query", "x");
        store
            .get_or_compute(Namespace::Events, &key, async { Ok::<_, String>(value("x")) })
            .await
            .unwrap();
        store.purge_expired().await.unwrap();
        assert_eq!(store.stats().entry_count, 1);

        store.invalidate_all().await.unwrap();
        assert!(store.peek(Namespace::Events, &key).await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_miss_leaves_no_entry() {
        let store = Arc::new(CacheStore::with_limits(10, 60));
        let key = CanonicalKey::new().text("query", "abandoned");
        let started = Arc::new(tokio::sync::Notify::new());

        let task = {
            let store = store.clone();
            let key = key.clone();
            let started = started.clone();
            tokio::spawn(async move {
                store
                    .get_or_compute(Namespace::Search, &key, async move {
                        started.notify_one();
                        std::future::pending::<()>().await;
                        Ok::<_, String>(value("never"))
                    })
                    .await
            })
        };

        started.notified().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(store.peek(Namespace::Search, &key).await.is_none());

        let (fresh, hit) = store
            .get_or_compute(Namespace::Search, &key, async { Ok::<_, String>(value("fresh")) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(fresh.payload["text"], "fresh");
    }

    fn persistent_config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig {
            directory: dir.to_path_buf(),
            persist: true,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_persisted_entries_survive_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let key = CanonicalKey::new().text("query", "climate rally");

        let first = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        assert_eq!(first.directory(), Some(dir.path()));
        let (_, hit) = first
            .get_or_compute(Namespace::Search, &key, async { Ok::<_, String>(value("stored")) })
            .await
            .unwrap();
        assert!(!hit);
        drop(first);

        let second = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        let calls = AtomicUsize::new(0);
        let (reloaded, hit) = second
            .get_or_compute(Namespace::Search, &key, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(value("recomputed"))
            })
            .await
            .unwrap();

        assert!(hit);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(reloaded.payload["text"], "stored");
    }

    #[tokio::test]
    async fn test_failures_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let key = CanonicalKey::new().text("query", "flaky");

        let store = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        let result = store
            .get_or_compute(Namespace::Search, &key, async {
                Err::<CachedValue, String>("upstream 503".to_string())
            })
            .await;
        assert!(result.is_err());

        let disk = DiskStore::open(dir.path()).await.unwrap();
        assert!(disk.load(Duration::from_secs(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_files_are_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let key = CanonicalKey::new().text("query", "last week");
        let disk = DiskStore::open(dir.path()).await.unwrap();

        let mut stale = value("stale");
        stale.cached_at = Utc::now() - chrono::Duration::hours(48);
        disk.write(&CacheKey::new(Namespace::Search, &key), &stale)
            .await
            .unwrap();

        let store = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        assert!(store.peek(Namespace::Search, &key).await.is_none());
        assert!(disk.load(Duration::from_secs(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key = CanonicalKey::new().text("query", "x");

        let store = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        store
            .get_or_compute(Namespace::Events, &key, async { Ok::<_, String>(value("x")) })
            .await
            .unwrap();
        store.invalidate_all().await.unwrap();

        let reopened = CacheStore::open(&persistent_config(dir.path())).await.unwrap();
        assert!(reopened.peek(Namespace::Events, &key).await.is_none());
    }
}
