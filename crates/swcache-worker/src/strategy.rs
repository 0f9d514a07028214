//! Stale-while-revalidate caching for ordinary requests.

use std::sync::Arc;

use http::{Method, StatusCode};
use swcache_net::{Fetcher, NetError, Request, Response};
use tracing::{debug, trace, warn};

use crate::cache::CacheEntry;
use crate::store::CacheStore;
use crate::{HandledResponse, ResponseSource, ServiceWorkerError};

/// Whether a network response may be written to the cache.
///
/// GET only; a 200 or an opaque cross-origin response.
pub fn is_cacheable(request: &Request, response: &Response) -> bool {
    request.method == Method::GET && (response.is_opaque() || response.status == StatusCode::OK)
}

/// Serve from cache when possible, refreshing the entry from the network
/// on every request.
#[derive(Clone)]
pub struct StaleWhileRevalidate {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: Arc<str>,
}

impl StaleWhileRevalidate {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store,
            fetcher,
            cache_name: cache_name.into(),
        }
    }

    /// Handle a request.
    ///
    /// A cache hit returns at once with the refresh still running in
    /// `revalidation`. A miss waits for the network; the fresh response is
    /// already stored when this returns.
    pub async fn handle(&self, request: Request) -> Result<HandledResponse, ServiceWorkerError> {
        let cached = self.lookup(&request).await;

        let revalidation = tokio::spawn(revalidate(
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.cache_name),
            request.clone(),
        ));

        if let Some(response) = cached {
            trace!(url = %request.url, "Serving stale response");
            return Ok(HandledResponse::from_cache(response, revalidation));
        }

        match revalidation.await {
            Ok(Ok(response)) => Ok(HandledResponse::new(response, ResponseSource::Network)),
            Ok(Err(e)) => Err(ServiceWorkerError::Network(e)),
            Err(join) => Err(ServiceWorkerError::StateError(format!(
                "revalidation task for {} failed: {}",
                request.url, join
            ))),
        }
    }

    /// Cache lookup. Read errors and unreadable entries count as misses.
    async fn lookup(&self, request: &Request) -> Option<Response> {
        let entry = match self.store.match_request(&self.cache_name, request).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache read failed");
                return None;
            }
        };
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }
}

async fn revalidate(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: Arc<str>,
    request: Request,
) -> Result<Response, NetError> {
    let response = match fetcher.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %request.url, error = %e, "Revalidation fetch failed");
            return Err(e);
        }
    };

    if is_cacheable(&request, &response) {
        let entry = CacheEntry::from_response(&request, &response);
        match store.put(&cache_name, entry).await {
            Ok(()) => debug!(url = %request.url, "Cache refreshed"),
            Err(e) => warn!(url = %request.url, error = %e, "Cache write failed"),
        }
    } else {
        trace!(url = %request.url, status = response.status_code(), "Response not cacheable");
    }

    Ok(response)
}
