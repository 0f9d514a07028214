//! Install-time precaching.

use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashSet;
use swcache_net::{Fetcher, Request, RequestMode};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{request_key, CacheEntry};
use crate::store::CacheStore;
use crate::ServiceWorkerError;

/// Ordered list of URLs to fetch and store at install time.
///
/// Always contains the offline fallback page.
#[derive(Debug, Clone)]
pub struct PrecacheManifest {
    urls: Vec<Url>,
    offline_fallback: Url,
}

impl PrecacheManifest {
    /// Resolve entries against `origin`, dropping duplicates and appending the
    /// offline fallback if the entries do not already list it.
    pub fn new<S: AsRef<str>>(
        origin: &Url,
        entries: &[S],
        offline_fallback: &str,
    ) -> Result<Self, ServiceWorkerError> {
        let resolve = |entry: &str| {
            origin.join(entry).map_err(|e| ServiceWorkerError::InstallFailed {
                url: entry.to_string(),
                reason: format!("invalid manifest url: {}", e),
            })
        };

        let mut seen = HashSet::new();
        let mut urls = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            let url = resolve(entry.as_ref())?;
            if seen.insert(request_key(&url)) {
                urls.push(url);
            }
        }

        let offline_fallback = resolve(offline_fallback)?;
        if seen.insert(request_key(&offline_fallback)) {
            urls.push(offline_fallback.clone());
        }

        Ok(Self {
            urls,
            offline_fallback,
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn offline_fallback(&self) -> &Url {
        &self.offline_fallback
    }

    pub fn contains(&self, url: &Url) -> bool {
        let key = request_key(url);
        self.urls.iter().any(|u| request_key(u) == key)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Summary of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheReport {
    pub cache_name: String,
    pub entries: usize,
    pub bytes: usize,
}

/// Fetches the manifest and stores it in one atomic write.
pub struct PrecacheLoader {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
    origin: Url,
}

impl PrecacheLoader {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<String>,
        origin: Url,
    ) -> Self {
        Self {
            store,
            fetcher,
            cache_name: cache_name.into(),
            origin,
        }
    }

    /// Install the manifest.
    ///
    /// Fails on the first entry that cannot be fetched or is not a 2xx,
    /// non-opaque response; in that case nothing is written.
    pub async fn install(
        &self,
        manifest: &PrecacheManifest,
    ) -> Result<PrecacheReport, ServiceWorkerError> {
        info!(cache = %self.cache_name, entries = manifest.len(), "Precaching manifest");
        self.store.open(&self.cache_name).await?;

        let fetches = manifest.urls().iter().map(|url| self.fetch_entry(url.clone()));
        let entries = try_join_all(fetches).await.map_err(|e| {
            warn!(cache = %self.cache_name, error = %e, "Precache failed");
            e
        })?;

        let bytes = entries.iter().map(|e| e.body.len()).sum();
        let count = entries.len();
        self.store.put_all(&self.cache_name, entries).await?;

        info!(cache = %self.cache_name, entries = count, bytes, "Precache complete");
        Ok(PrecacheReport {
            cache_name: self.cache_name.clone(),
            entries: count,
            bytes,
        })
    }

    async fn fetch_entry(&self, url: Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url)
            .mode(RequestMode::Cors)
            .referrer(self.origin.clone());

        let response = self.fetcher.fetch(&request).await.map_err(|e| {
            ServiceWorkerError::InstallFailed {
                url: request.url.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed {
                url: request.url.to_string(),
                reason: format!("bad response status {}", response.status_code()),
            });
        }

        debug!(url = %request.url, bytes = response.body().len(), "Precached");
        Ok(CacheEntry::from_response(&request, &response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;
    use crate::test_support::{get, url, MockFetcher, ORIGIN};
    use http::StatusCode;

    const CACHE: &str = "test-cache";

    fn manifest(entries: &[&str]) -> PrecacheManifest {
        PrecacheManifest::new(&Url::parse(ORIGIN).unwrap(), entries, "/404").unwrap()
    }

    fn loader(store: Arc<MemoryCacheStore>, fetcher: Arc<MockFetcher>) -> PrecacheLoader {
        PrecacheLoader::new(store, fetcher, CACHE, Url::parse(ORIGIN).unwrap())
    }

    #[test]
    fn test_manifest_appends_fallback_and_dedupes() {
        let m = manifest(&["/", "/assets/css/styles.min.css", "/#top"]);
        let urls: Vec<&str> = m.urls().iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/",
                "https://example.com/assets/css/styles.min.css",
                "https://example.com/404",
            ]
        );
        assert!(m.contains(&url("/404")));
    }

    #[test]
    fn test_manifest_keeps_listed_fallback_position() {
        let m = manifest(&["/", "/404", "/assets/js/404.min.js"]);
        assert_eq!(m.len(), 3);
        assert_eq!(m.urls()[1], url("/404"));
    }

    #[tokio::test]
    async fn test_install_stores_every_entry() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve("/", "home").await;
        fetcher.serve("/404", "offline").await;
        fetcher.serve("/assets/css/styles.min.css", "css").await;

        let report = loader(store.clone(), fetcher.clone())
            .install(&manifest(&["/", "/assets/css/styles.min.css"]))
            .await
            .unwrap();

        assert_eq!(report.entries, 3);
        assert_eq!(report.bytes, "home".len() + "css".len() + "offline".len());

        fetcher.set_offline(true);
        for path in ["/", "/404", "/assets/css/styles.min.css"] {
            let hit = store.match_request(CACHE, &get(path)).await.unwrap();
            assert!(hit.is_some(), "{} missing from cache", path);
        }
    }

    #[tokio::test]
    async fn test_install_fails_on_network_error_and_writes_nothing() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve("/", "home").await;
        fetcher.serve("/404", "offline").await;
        // styles.min.css is not served: the fetch fails.

        let result = loader(store.clone(), fetcher)
            .install(&manifest(&["/", "/assets/css/styles.min.css"]))
            .await;

        match result {
            Err(ServiceWorkerError::InstallFailed { url, .. }) => {
                assert_eq!(url, "https://example.com/assets/css/styles.min.css")
            }
            other => panic!("expected install failure, got {:?}", other),
        }
        assert!(store.keys(CACHE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve("/", "home").await;
        fetcher
            .serve_status("/404", StatusCode::NOT_FOUND, "not found")
            .await;

        let result = loader(store.clone(), fetcher).install(&manifest(&["/"])).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed { .. })));
        assert!(store.keys(CACHE).await.unwrap().is_empty());
    }
}
