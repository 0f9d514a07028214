//! The offline worker: one handler per event kind.

use std::fmt;
use std::sync::Arc;

use swcache_net::{Fetcher, Request};
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::WorkerConfig;
use crate::lifecycle::{LifecycleController, MessageOutcome};
use crate::navigation::{NavigationInterceptor, PreloadResponse};
use crate::precache::{PrecacheLoader, PrecacheManifest, PrecacheReport};
use crate::router::{RouteDecision, RouteHandler, Router};
use crate::store::CacheStore;
use crate::strategy::StaleWhileRevalidate;
use crate::{HandledResponse, ResponseSource, ServiceWorkerError};

/// Runtime capabilities, resolved once when the worker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCapabilities {
    /// Navigation preload will be enabled and awaited.
    pub navigation_preload: bool,
}

impl WorkerCapabilities {
    /// Combine what the runtime supports with what the config asks for.
    pub fn detect(config: &WorkerConfig, runtime_supports_preload: bool) -> Self {
        Self {
            navigation_preload: config.navigation_preload && runtime_supports_preload,
        }
    }
}

/// A fetch intercepted by the worker.
pub struct FetchEvent {
    pub request: Request,
    pub preload_response: Option<PreloadResponse>,
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload_response: None,
            client_id: None,
        }
    }

    /// Attach the runtime's navigation preload.
    pub fn with_preload(mut self, preload: PreloadResponse) -> Self {
        self.preload_response = Some(preload);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvent")
            .field("request", &self.request)
            .field("preload_response", &self.preload_response.is_some())
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// A message posted by a page.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: serde_json::Value,
}

impl MessageEvent {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data }
    }
}

/// Event kinds the worker handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
}

/// An event delivered by the runtime.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(MessageEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
        }
    }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
    /// Precache stored.
    Installed(PrecacheReport),
    /// Activation done; whether navigation preload should be enabled.
    Activated { navigation_preload: bool },
    /// Response for a fetch.
    Response(HandledResponse),
    /// Result of a message.
    Message(MessageOutcome),
}

/// Offline caching worker for one origin.
pub struct OfflineWorker {
    config: WorkerConfig,
    script_url: Url,
    manifest: PrecacheManifest,
    capabilities: WorkerCapabilities,
    fetcher: Arc<dyn Fetcher>,
    router: Router,
    precache: PrecacheLoader,
    lifecycle: LifecycleController,
    stale_while_revalidate: StaleWhileRevalidate,
    navigation: NavigationInterceptor,
}

impl OfflineWorker {
    /// Build a worker; sub-resource routes come from `config.routes`.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        capabilities: WorkerCapabilities,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let script_url = config.script_url()?;
        let manifest = config.manifest()?;
        let router = config.router()?;

        let precache = PrecacheLoader::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            config.cache_name.clone(),
            config.origin.clone(),
        );
        let stale_while_revalidate = StaleWhileRevalidate::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            config.cache_name.as_str(),
        );
        let navigation = NavigationInterceptor::new(
            store,
            Arc::clone(&fetcher),
            config.cache_name.as_str(),
            manifest.offline_fallback().clone(),
            capabilities.navigation_preload,
        );

        info!(
            cache = %config.cache_name,
            origin = %config.origin,
            manifest = manifest.len(),
            routes = router.routes().len(),
            navigation_preload = capabilities.navigation_preload,
            "Offline worker created"
        );

        Ok(Self {
            config,
            script_url,
            manifest,
            capabilities,
            fetcher,
            router,
            precache,
            lifecycle: LifecycleController::new(),
            stale_while_revalidate,
            navigation,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.manifest
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        self.capabilities
    }

    /// Handle any event.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        debug!(kind = ?event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => Ok(EventOutcome::Activated {
                navigation_preload: self.activate(),
            }),
            WorkerEvent::Fetch(fetch) => self.handle_fetch(fetch).await.map(EventOutcome::Response),
            WorkerEvent::Message(message) => {
                Ok(EventOutcome::Message(self.handle_message(&message)))
            }
        }
    }

    /// Install: precache the manifest.
    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    pub async fn install(&self) -> Result<PrecacheReport, ServiceWorkerError> {
        self.precache.install(&self.manifest).await
    }

    /// Activate: report whether navigation preload should be turned on.
    pub fn activate(&self) -> bool {
        info!(navigation_preload = self.capabilities.navigation_preload, "Worker activated");
        self.capabilities.navigation_preload
    }

    /// Fetch: route and handle.
    pub async fn handle_fetch(
        &self,
        event: FetchEvent,
    ) -> Result<HandledResponse, ServiceWorkerError> {
        let FetchEvent {
            request,
            preload_response,
            ..
        } = event;

        match self.router.route(&request) {
            RouteDecision::Navigation => Ok(self
                .navigation
                .handle(request, preload_response)
                .await
                .into()),
            RouteDecision::Handler(RouteHandler::StaleWhileRevalidate) => {
                self.stale_while_revalidate.handle(request).await
            }
            RouteDecision::Passthrough => {
                let response = self.fetcher.fetch(&request).await?;
                Ok(HandledResponse::new(response, ResponseSource::Network))
            }
        }
    }

    /// Message: interpret lifecycle commands.
    pub fn handle_message(&self, event: &MessageEvent) -> MessageOutcome {
        self.lifecycle.handle_message(&event.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;
    use crate::test_support::{get, url, MockFetcher, ORIGIN};
    use bytes::Bytes;
    use serde_json::json;

    fn config() -> WorkerConfig {
        WorkerConfig {
            precache: vec!["/".to_string(), "/assets/css/styles.min.css".to_string()],
            ..WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
        }
    }

    async fn serving_fetcher() -> Arc<MockFetcher> {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve("/", "home").await;
        fetcher.serve("/404", "offline").await;
        fetcher.serve("/assets/css/styles.min.css", "css").await;
        fetcher
    }

    fn worker(
        store: Arc<MemoryCacheStore>,
        fetcher: Arc<MockFetcher>,
        preload: bool,
    ) -> OfflineWorker {
        let config = config();
        let capabilities = WorkerCapabilities::detect(&config, preload);
        OfflineWorker::new(config, store, fetcher, capabilities).unwrap()
    }

    #[test]
    fn test_capabilities_need_config_and_runtime() {
        let mut config = config();
        assert!(WorkerCapabilities::detect(&config, true).navigation_preload);
        assert!(!WorkerCapabilities::detect(&config, false).navigation_preload);
        config.navigation_preload = false;
        assert!(!WorkerCapabilities::detect(&config, true).navigation_preload);
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(WorkerEvent::Install.kind(), EventKind::Install);
        let fetch = WorkerEvent::Fetch(FetchEvent::new(get("/")));
        assert_eq!(fetch.kind(), EventKind::Fetch);
        let message = WorkerEvent::Message(MessageEvent::new(json!({})));
        assert_eq!(message.kind(), EventKind::Message);
    }

    #[tokio::test]
    async fn test_install_event_precaches_manifest() {
        let store = Arc::new(MemoryCacheStore::new());
        let worker = worker(store.clone(), serving_fetcher().await, true);

        match worker.dispatch(WorkerEvent::Install).await.unwrap() {
            EventOutcome::Installed(report) => assert_eq!(report.entries, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(store.keys(&worker.config().cache_name).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_activate_event_reports_preload() {
        let store = Arc::new(MemoryCacheStore::new());
        let worker = worker(store, serving_fetcher().await, true);
        assert!(matches!(
            worker.dispatch(WorkerEvent::Activate).await.unwrap(),
            EventOutcome::Activated {
                navigation_preload: true
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_event_routes_to_strategy() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = serving_fetcher().await;
        let worker = worker(store, fetcher.clone(), false);
        worker.install().await.unwrap();

        fetcher.set_offline(true);
        let handled = worker
            .handle_fetch(FetchEvent::new(get("/assets/css/styles.min.css")))
            .await
            .unwrap();
        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(handled.response.body().as_ref(), b"css");
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_fallback() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = serving_fetcher().await;
        let worker = worker(store, fetcher.clone(), true);
        worker.install().await.unwrap();

        fetcher.set_offline(true);
        let handled = worker
            .handle_fetch(FetchEvent::new(Request::navigate(url("/blog/some-post"))))
            .await
            .unwrap();
        assert_eq!(handled.source, ResponseSource::OfflineFallback);
        assert_eq!(handled.response.body().as_ref(), b"offline");
    }

    #[tokio::test]
    async fn test_post_passes_through_uncached() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = serving_fetcher().await;
        let worker = worker(store.clone(), fetcher, false);

        let post = Request::post(url("/"), Bytes::from_static(b"x"));
        let handled = worker.handle_fetch(FetchEvent::new(post)).await.unwrap();

        assert_eq!(handled.source, ResponseSource::Network);
        assert!(store.keys(&worker.config().cache_name).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_get_skips_cache() {
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = serving_fetcher().await;
        fetcher.serve("/api/now", "12:00").await;
        let config = WorkerConfig {
            routes: vec!["/assets/".to_string()],
            ..config()
        };
        let capabilities = WorkerCapabilities::detect(&config, false);
        let worker = OfflineWorker::new(config, store.clone(), fetcher, capabilities).unwrap();

        let mut asset = worker
            .handle_fetch(FetchEvent::new(get("/assets/css/styles.min.css")))
            .await
            .unwrap();
        asset.settle().await;
        let api = worker
            .handle_fetch(FetchEvent::new(get("/api/now")))
            .await
            .unwrap();

        assert_eq!(api.source, ResponseSource::Network);
        assert_eq!(api.response.body().as_ref(), b"12:00");
        assert_eq!(
            store.keys(&worker.config().cache_name).await.unwrap(),
            vec![url("/assets/css/styles.min.css").to_string()]
        );
    }

    #[tokio::test]
    async fn test_message_event() {
        let store = Arc::new(MemoryCacheStore::new());
        let worker = worker(store, serving_fetcher().await, false);

        let outcome = worker
            .dispatch(WorkerEvent::Message(MessageEvent::new(json!({"type": "SKIP_WAITING"}))))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Message(MessageOutcome::SkipWaiting)));

        let ignored = worker.handle_message(&MessageEvent::new(json!({"type": "PING"})));
        assert_eq!(ignored, MessageOutcome::Ignored);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorkerConfig {
            cache_name: String::new(),
            ..config()
        };
        let capabilities = WorkerCapabilities::detect(&config, false);
        let result = OfflineWorker::new(
            config,
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MockFetcher::new()),
            capabilities,
        );
        assert!(matches!(result, Err(ServiceWorkerError::Storage(_))));
    }
}
