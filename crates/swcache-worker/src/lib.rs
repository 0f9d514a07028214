//! # swcache worker
//!
//! Offline caching service worker for a single origin.
//!
//! ## Features
//!
//! - **Precache**: fetch and store a fixed asset manifest at install time
//! - **Lifecycle**: installing → waiting → active, with a `SKIP_WAITING` message
//! - **Stale-while-revalidate**: serve from cache, refresh in the background
//! - **Navigation fallback**: navigation preload, then network, then the
//!   cached offline page
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (registration + clients)
//!     │
//!     └── OfflineWorker ── dispatch(WorkerEvent)
//!             ├── Install  → PrecacheLoader
//!             ├── Activate → navigation preload flag
//!             ├── Message  → LifecycleController
//!             └── Fetch    → Router
//!                     ├── navigate → NavigationInterceptor
//!                     ├── GET /*   → StaleWhileRevalidate
//!                     └── other    → network passthrough
//!
//! CacheStore (memory or file)
//!     └── cache name → url → CacheEntry
//! ```

use swcache_common::SwCacheError;
use swcache_net::{NetError, Response};
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod cache;
pub mod config;
pub mod host;
pub mod lifecycle;
pub mod navigation;
pub mod precache;
pub mod router;
pub mod store;
pub mod strategy;
pub mod worker;

pub use cache::{request_key, Cache, CacheEntry, CacheStorage};
pub use config::WorkerConfig;
pub use host::{HostEvent, WorkerHost};
pub use lifecycle::{
    LifecycleController, LifecycleMessage, MessageOutcome, ServiceWorker, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState,
};
pub use navigation::{NavigationInterceptor, NavigationOutcome, NavigationPhase, PreloadResponse};
pub use precache::{PrecacheLoader, PrecacheManifest, PrecacheReport};
pub use router::{Route, RouteDecision, RouteHandler, Router};
pub use store::{CacheStore, FileCacheStore, MemoryCacheStore};
pub use strategy::{is_cacheable, StaleWhileRevalidate};
pub use worker::{
    EventKind, EventOutcome, FetchEvent, MessageEvent, OfflineWorker, WorkerCapabilities,
    WorkerEvent,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] SwCacheError),
}

// ==================== Responses ====================

/// Where a handled response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served from the cache store.
    Cache,
    /// Fetched from the network by the worker.
    Network,
    /// Navigation preload started by the runtime.
    Preload,
    /// The cached offline page, served because the network failed.
    OfflineFallback,
}

/// Background refresh of a cache entry; resolves to the fresh network response.
pub type Revalidation = JoinHandle<Result<Response, NetError>>;

/// A response produced by the worker for an intercepted fetch.
#[derive(Debug)]
pub struct HandledResponse {
    /// The response delivered to the page.
    pub response: Response,
    /// Where it came from.
    pub source: ResponseSource,
    /// Background revalidation still in flight, if any.
    pub revalidation: Option<Revalidation>,
}

impl HandledResponse {
    /// A response that needs no further background work.
    pub fn new(response: Response, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            revalidation: None,
        }
    }

    /// A cached response whose refresh is still running.
    pub fn from_cache(response: Response, revalidation: Revalidation) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
            revalidation: Some(revalidation),
        }
    }

    /// Wait for background revalidation to finish, discarding its result.
    pub async fn settle(&mut self) {
        if let Some(task) = self.revalidation.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support;
