//! Cache store handles: the async seam every worker component goes through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http::Method;
use swcache_common::SwCacheError;
use swcache_net::Request;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Cache, CacheEntry, CacheStorage};
use crate::ServiceWorkerError;

/// Named, persistent mapping from GET request URLs to stored responses.
///
/// Only GET entries may be stored; non-GET lookups never match.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, cache_name: &str) -> Result<(), ServiceWorkerError>;

    /// Check if a cache exists.
    async fn has(&self, cache_name: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up a request.
    async fn match_request(
        &self,
        cache_name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store an entry, overwriting any entry with the same key.
    async fn put(&self, cache_name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Store every entry or none of them.
    async fn put_all(
        &self,
        cache_name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError>;

    /// Delete the entry for a URL.
    async fn delete(&self, cache_name: &str, url: &Url) -> Result<bool, ServiceWorkerError>;

    /// All keys of a cache, sorted. Empty if the cache does not exist.
    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a whole cache.
    async fn delete_cache(&self, cache_name: &str) -> Result<bool, ServiceWorkerError>;

    /// Names of all caches, sorted.
    async fn cache_names(&self) -> Result<Vec<String>, ServiceWorkerError>;
}

fn ensure_get(entry: &CacheEntry) -> Result<(), ServiceWorkerError> {
    if entry.is_get() {
        Ok(())
    } else {
        Err(ServiceWorkerError::CacheError(format!(
            "cannot store {} request for {}",
            entry.method, entry.url
        )))
    }
}

fn lookup(storage: &CacheStorage, cache_name: &str, request: &Request) -> Option<CacheEntry> {
    if request.method != Method::GET {
        return None;
    }
    storage
        .get(cache_name)
        .and_then(|cache| cache.match_url(&request.url))
        .cloned()
}

// ==================== Memory Store ====================

/// In-memory store. Used in tests and for throwaway workers.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    storage: RwLock<CacheStorage>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, cache_name: &str) -> Result<(), ServiceWorkerError> {
        self.storage.write().await.open(cache_name);
        Ok(())
    }

    async fn has(&self, cache_name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.read().await.has(cache_name))
    }

    async fn match_request(
        &self,
        cache_name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(lookup(&*self.storage.read().await, cache_name, request))
    }

    async fn put(&self, cache_name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        ensure_get(&entry)?;
        self.storage.write().await.open(cache_name).put(entry);
        Ok(())
    }

    async fn put_all(
        &self,
        cache_name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        entries.iter().try_for_each(ensure_get)?;
        let mut storage = self.storage.write().await;
        let cache = storage.open(cache_name);
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn delete(&self, cache_name: &str, url: &Url) -> Result<bool, ServiceWorkerError> {
        let mut storage = self.storage.write().await;
        if !storage.has(cache_name) {
            return Ok(false);
        }
        Ok(storage.open(cache_name).delete(url))
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .get(cache_name)
            .map(Cache::keys)
            .unwrap_or_default())
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.write().await.delete(cache_name))
    }

    async fn cache_names(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.storage.read().await.keys())
    }
}

// ==================== File Store ====================

/// Store that keeps one JSON document per cache under a directory.
///
/// Reads are served from an in-memory mirror loaded at open time. Every
/// mutation is staged on a copy of the cache, written to disk (temp file +
/// rename) and only then swapped into the mirror, all under the write lock.
#[derive(Debug)]
pub struct FileCacheStore {
    dir: PathBuf,
    storage: RwLock<CacheStorage>,
}

impl FileCacheStore {
    /// Open a store rooted at `dir`, loading any caches already on disk.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(SwCacheError::from)?;

        let mut storage = CacheStorage::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(SwCacheError::from)?;
        while let Some(item) = read_dir.next_entry().await.map_err(SwCacheError::from)? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_cache(&path).await {
                Ok(cache) => {
                    debug!(
                        path = %path.display(),
                        cache = %cache.name,
                        entries = cache.len(),
                        "Loaded cache"
                    );
                    storage.insert(cache);
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        category = e.category(),
                        error = %e,
                        "Skipping unreadable cache file"
                    );
                }
            }
        }

        info!(dir = %dir.display(), caches = storage.keys().len(), "FileCacheStore opened");

        Ok(Self {
            dir,
            storage: RwLock::new(storage),
        })
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a cache. Bytes outside `[A-Za-z0-9.-]` are written as `_XX`
    /// hex, so distinct names never share a file.
    fn cache_path(&self, cache_name: &str) -> PathBuf {
        let mut file_stem = String::with_capacity(cache_name.len());
        for byte in cache_name.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
                file_stem.push(byte as char);
            } else {
                file_stem.push_str(&format!("_{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", file_stem))
    }

    fn staged(storage: &CacheStorage, cache_name: &str) -> Cache {
        storage
            .get(cache_name)
            .cloned()
            .unwrap_or_else(|| Cache::new(cache_name))
    }

    async fn persist(&self, cache: &Cache) -> Result<(), SwCacheError> {
        let path = self.cache_path(&cache.name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec(cache)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), entries = cache.len(), "Cache persisted");
        Ok(())
    }
}

async fn load_cache(path: &Path) -> Result<Cache, SwCacheError> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data).map_err(|e| SwCacheError::storage(path, e.to_string()))
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn open(&self, cache_name: &str) -> Result<(), ServiceWorkerError> {
        let mut storage = self.storage.write().await;
        if storage.has(cache_name) {
            return Ok(());
        }
        let cache = Cache::new(cache_name);
        self.persist(&cache).await?;
        storage.insert(cache);
        Ok(())
    }

    async fn has(&self, cache_name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.read().await.has(cache_name))
    }

    async fn match_request(
        &self,
        cache_name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(lookup(&*self.storage.read().await, cache_name, request))
    }

    async fn put(&self, cache_name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        ensure_get(&entry)?;
        let mut storage = self.storage.write().await;
        let mut staged = Self::staged(&storage, cache_name);
        staged.put(entry);
        self.persist(&staged).await?;
        storage.insert(staged);
        Ok(())
    }

    async fn put_all(
        &self,
        cache_name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        entries.iter().try_for_each(ensure_get)?;
        let mut storage = self.storage.write().await;
        let mut staged = Self::staged(&storage, cache_name);
        for entry in entries {
            staged.put(entry);
        }
        self.persist(&staged).await?;
        storage.insert(staged);
        Ok(())
    }

    async fn delete(&self, cache_name: &str, url: &Url) -> Result<bool, ServiceWorkerError> {
        let mut storage = self.storage.write().await;
        if !storage.has(cache_name) {
            return Ok(false);
        }
        let mut staged = Self::staged(&storage, cache_name);
        if !staged.delete(url) {
            return Ok(false);
        }
        self.persist(&staged).await?;
        storage.insert(staged);
        Ok(true)
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .get(cache_name)
            .map(Cache::keys)
            .unwrap_or_default())
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<bool, ServiceWorkerError> {
        let mut storage = self.storage.write().await;
        if !storage.has(cache_name) {
            return Ok(false);
        }
        let path = self.cache_path(cache_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SwCacheError::from(e).into()),
        }
        storage.delete(cache_name);
        Ok(true)
    }

    async fn cache_names(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.storage.read().await.keys())
    }
}
