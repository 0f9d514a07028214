//! Navigation interception: preload, then network, then the offline page.

use std::sync::Arc;

use futures::future::BoxFuture;
use http::{HeaderValue, StatusCode};
use swcache_net::{Fetcher, NetError, Request, Response, ResponseType};
use tracing::{debug, error, info, trace};
use url::Url;

use crate::store::CacheStore;
use crate::{HandledResponse, ResponseSource};

/// Navigation preload handed over by the runtime. Resolves to `None` when
/// the runtime did not start a preload for this navigation.
pub type PreloadResponse = BoxFuture<'static, Result<Option<Response>, NetError>>;

/// Steps a navigation passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationPhase {
    Start,
    AwaitingPreload,
    PreloadHit,
    PreloadMiss,
    AwaitingNetwork,
    NetworkOk,
    NetworkErr,
    Respond,
    RespondWithFallback,
}

/// Result of one navigation, with the phases it went through.
#[derive(Debug)]
pub struct NavigationOutcome {
    pub response: Response,
    pub source: ResponseSource,
    pub phases: Vec<NavigationPhase>,
}

impl From<NavigationOutcome> for HandledResponse {
    fn from(outcome: NavigationOutcome) -> Self {
        HandledResponse::new(outcome.response, outcome.source)
    }
}

/// Handles top-level navigations. Always produces a response.
#[derive(Clone)]
pub struct NavigationInterceptor {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: Arc<str>,
    offline_fallback: Url,
    preload_enabled: bool,
}

impl NavigationInterceptor {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<Arc<str>>,
        offline_fallback: Url,
        preload_enabled: bool,
    ) -> Self {
        Self {
            store,
            fetcher,
            cache_name: cache_name.into(),
            offline_fallback,
            preload_enabled,
        }
    }

    pub fn preload_enabled(&self) -> bool {
        self.preload_enabled
    }

    /// Handle a navigation.
    ///
    /// Any network error, from the preload or the fetch, is answered with
    /// the cached offline page.
    pub async fn handle(
        &self,
        request: Request,
        preload: Option<PreloadResponse>,
    ) -> NavigationOutcome {
        let mut phases = vec![NavigationPhase::Start];

        match self.respond(&request, preload, &mut phases).await {
            Ok((response, source)) => {
                phases.push(NavigationPhase::Respond);
                trace!(
                    url = %request.url,
                    ?source,
                    status = %response.status,
                    "Navigation answered"
                );
                NavigationOutcome {
                    response,
                    source,
                    phases,
                }
            }
            Err(e) => {
                phases.push(NavigationPhase::NetworkErr);
                info!(url = %request.url, error = %e, "Navigation failed, serving offline page");
                let response = self.offline_page().await;
                phases.push(NavigationPhase::RespondWithFallback);
                NavigationOutcome {
                    response,
                    source: ResponseSource::OfflineFallback,
                    phases,
                }
            }
        }
    }

    async fn respond(
        &self,
        request: &Request,
        preload: Option<PreloadResponse>,
        phases: &mut Vec<NavigationPhase>,
    ) -> Result<(Response, ResponseSource), NetError> {
        if self.preload_enabled {
            phases.push(NavigationPhase::AwaitingPreload);
            let preloaded = match preload {
                Some(preload) => preload.await?,
                None => None,
            };
            if let Some(response) = preloaded {
                phases.push(NavigationPhase::PreloadHit);
                return Ok((response, ResponseSource::Preload));
            }
            phases.push(NavigationPhase::PreloadMiss);
        }

        phases.push(NavigationPhase::AwaitingNetwork);
        let response = self.fetcher.fetch(request).await?;
        phases.push(NavigationPhase::NetworkOk);
        Ok((response, ResponseSource::Network))
    }

    async fn offline_page(&self) -> Response {
        let fallback = Request::get(self.offline_fallback.clone());
        let entry = match self.store.match_request(&self.cache_name, &fallback).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, "Cache read failed while serving offline page");
                None
            }
        };

        match entry.map(|e| e.to_response()) {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                error!(url = %self.offline_fallback, error = %e, "Offline page entry unreadable");
                self.unavailable()
            }
            None => {
                error!(url = %self.offline_fallback, "Offline page missing from cache");
                self.unavailable()
            }
        }
    }

    fn unavailable(&self) -> Response {
        debug!("Synthesizing 503 offline response");
        Response::new(
            self.offline_fallback.clone(),
            StatusCode::SERVICE_UNAVAILABLE,
            "You are offline.",
        )
        .with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .with_type(ResponseType::Default)
    }
}
