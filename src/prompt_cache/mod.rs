//! Prompt cache: LRU with TTL-based background refresh.
//!
//! `max_size == 0` disables the cache entirely — `get`/`set` become no-ops
//! and metrics stop mutating, per the documented escape hatch for
//! environments that can't spare the memory. `ttl` of `None` disables the
//! refresh timer but keeps the cache itself active.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use lru::LruCache;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::{CacheError, ErrorCode, StructuredError};

static GLOBAL: OnceCell<Arc<PromptCache>> = OnceCell::new();

/// Installs (or returns the already-installed) process-wide cache.
pub fn global(config: PromptCacheConfig) -> Arc<PromptCache> {
    GLOBAL.get_or_init(|| Arc::new(PromptCache::new(config))).clone()
}

#[derive(Debug, Clone)]
pub struct PromptCacheConfig {
    pub max_size: usize,
    pub ttl: Option<Duration>,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub refresh_errors: AtomicU64,
}

struct Entry {
    value: String,
    cached_at: Instant,
    inserted_at_ms: i64,
}

const CACHE_DUMP_VERSION: u32 = 1;

/// On-disk layout for `dump`/`load`: `{ version, entries: [...], metrics }`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheDump {
    version: u32,
    entries: Vec<DumpEntry>,
    metrics: DumpMetrics,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DumpMetrics {
    hits: u64,
    misses: u64,
    refreshes: u64,
    refresh_errors: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpEntry {
    key: String,
    value: String,
    #[serde(rename = "insertedAt")]
    inserted_at: i64,
}

/// A refresh function supplied by the caller (typically an HTTP fetch of
/// the latest prompt body); invoked from the background refresh loop.
pub type Refresher = Arc<dyn Fn(String) -> RefreshFuture + Send + Sync>;
pub type RefreshFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, StructuredError>> + Send>>;

pub struct PromptCache {
    config: PromptCacheConfig,
    store: Mutex<LruCache<String, Entry>>,
    refreshing: DashSet<String>,
    metrics: CacheMetrics,
    refresher: Mutex<Option<Refresher>>,
    stop: Arc<tokio::sync::Notify>,
}

impl PromptCache {
    pub fn new(config: PromptCacheConfig) -> Self {
        let capacity = std::num::NonZeroUsize::new(config.max_size.max(1)).unwrap();
        Self {
            store: Mutex::new(LruCache::new(capacity)),
            refreshing: DashSet::new(),
            metrics: CacheMetrics::default(),
            refresher: Mutex::new(None),
            stop: Arc::new(tokio::sync::Notify::new()),
            config,
        }
    }

    fn enabled(&self) -> bool {
        self.config.max_size > 0
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        let mut store = self.store.lock().await;
        match store.get(key) {
            Some(entry) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: String, value: String) {
        if !self.enabled() {
            return;
        }
        let mut store = self.store.lock().await;
        store.put(
            key,
            Entry {
                value,
                cached_at: Instant::now(),
                inserted_at_ms: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    pub async fn invalidate(&self, key: &str) {
        if !self.enabled() {
            return;
        }
        self.store.lock().await.pop(key);
    }

    pub async fn clear(&self) {
        if !self.enabled() {
            return;
        }
        self.store.lock().await.clear();
    }

    pub fn metrics(&self) -> (u64, u64, u64, u64) {
        (
            self.metrics.hits.load(Ordering::Relaxed),
            self.metrics.misses.load(Ordering::Relaxed),
            self.metrics.refreshes.load(Ordering::Relaxed),
            self.metrics.refresh_errors.load(Ordering::Relaxed),
        )
    }

    /// Starts the background refresh loop on a dedicated task. Disabled
    /// entirely when `ttl` is `None` or the cache itself is disabled.
    pub fn start_refresh_loop(self: &Arc<Self>, refresher: Refresher) {
        let Some(ttl) = self.config.ttl else { return };
        if !self.enabled() {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            *this.refresher.lock().await = Some(refresher);
            let mut interval = tokio::time::interval(ttl);
            loop {
                tokio::select! {
                    _ = interval.tick() => this.refresh_stale(ttl).await,
                    _ = this.stop.notified() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn refresh_stale(&self, ttl: Duration) {
        let stale_keys: Vec<String> = {
            let store = self.store.lock().await;
            store
                .iter()
                .filter(|(_, entry)| entry.cached_at.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let refresher = self.refresher.lock().await.clone();
        let Some(refresher) = refresher else { return };

        for key in stale_keys {
            if !self.refreshing.insert(key.clone()) {
                continue; // a refresh for this key is already in flight
            }
            let result = (refresher)(key.clone()).await;
            match result {
                Ok(new_value) => {
                    self.metrics.refreshes.fetch_add(1, Ordering::Relaxed);
                    self.set(key.clone(), new_value).await;
                }
                Err(_) => {
                    self.metrics.refresh_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.refreshing.remove(&key);
        }
    }

    /// Persists the current cache contents as JSON, in the
    /// `{ version, entries, metrics }` layout. Creates the parent directory
    /// if needed.
    pub async fn dump(&self, path: &Path) -> Result<(), StructuredError> {
        let store = self.store.lock().await;
        let entries: Vec<DumpEntry> = store
            .iter()
            .map(|(k, v)| DumpEntry {
                key: k.clone(),
                value: v.value.clone(),
                inserted_at: v.inserted_at_ms,
            })
            .collect();
        drop(store);

        let (hits, misses, refreshes, refresh_errors) = self.metrics();
        let dump = CacheDump {
            version: CACHE_DUMP_VERSION,
            entries,
            metrics: DumpMetrics {
                hits,
                misses,
                refreshes,
                refresh_errors,
            },
        };

        let json = serde_json::to_vec_pretty(&dump).map_err(CacheError::from)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StructuredError::new(ErrorCode::CACHE_PATH_UNWRITABLE, e.to_string())
            })?;
        }
        std::fs::write(path, json).map_err(|e| CacheError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Loads a previously dumped cache, replacing current contents.
    /// Tolerant: a missing or corrupt file is not an error, it just loads
    /// nothing. Returns the number of entries actually loaded.
    pub async fn load(&self, path: &Path) -> Result<usize, StructuredError> {
        let Ok(bytes) = std::fs::read(path) else {
            return Ok(0);
        };
        let Ok(dump) = serde_json::from_slice::<CacheDump>(&bytes) else {
            return Ok(0);
        };

        if !self.enabled() {
            return Ok(0);
        }

        let mut store = self.store.lock().await;
        store.clear();
        let mut loaded = 0usize;
        for entry in dump.entries {
            store.put(
                entry.key,
                Entry {
                    value: entry.value,
                    cached_at: Instant::now(),
                    inserted_at_ms: entry.inserted_at,
                },
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let cache = PromptCache::new(PromptCacheConfig { max_size: 0, ttl: None });
        cache.set("k".into(), "v".into()).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.metrics(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn set_then_get_hits() {
        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        cache.set("k".into(), "v".into()).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        let (hits, misses, _, _) = cache.metrics();
        assert_eq!(hits, 1);
        assert_eq!(misses, 0);
    }

    #[tokio::test]
    async fn miss_then_set_records_miss() {
        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        assert_eq!(cache.get("missing").await, None);
        let (_, misses, _, _) = cache.metrics();
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn dump_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cache.json");

        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        cache.set("a".into(), "1".into()).await;
        cache.set("b".into(), "2".into()).await;
        cache.dump(&path).await.unwrap();

        let reloaded = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        let loaded = reloaded.load(&path).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(reloaded.get("a").await, Some("1".to_string()));
        assert_eq!(reloaded.get("b").await, Some("2".to_string()));
    }

    #[tokio::test]
    async fn dump_writes_version_entries_and_metrics_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        cache.set("a".into(), "1".into()).await;
        cache.get("a").await;
        cache.dump(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["entries"][0]["key"], "a");
        assert!(value["entries"][0]["insertedAt"].is_i64());
        assert_eq!(value["metrics"]["hits"], 1);
    }

    #[tokio::test]
    async fn load_missing_file_returns_zero_without_erroring() {
        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        let loaded = cache.load(Path::new("/nonexistent/path/cache.json")).await.unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn load_corrupt_file_returns_zero_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        let loaded = cache.load(&path).await.unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = PromptCache::new(PromptCacheConfig {
            max_size: 4,
            ttl: None,
        });
        cache.set("k".into(), "v".into()).await;
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
