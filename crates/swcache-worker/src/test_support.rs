//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use swcache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{Mutex, Notify};
use url::Url;

use crate::cache::CacheEntry;

pub const ORIGIN: &str = "https://example.com/";

pub fn url(s: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(s).unwrap()
}

pub fn get(s: &str) -> Request {
    Request::get(url(s))
}

pub fn cache_entry(s: &str, body: &str) -> CacheEntry {
    CacheEntry {
        url: url(s).to_string(),
        method: "GET".to_string(),
        status: 200,
        opaque: false,
        headers: Vec::new(),
        body: body.as_bytes().to_vec(),
        cached_at: 0,
    }
}

/// Scripted fetcher: serves registered bodies, fails for everything else
/// (or for everything, when offline).
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    offline: std::sync::atomic::AtomicBool,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every fetch until the gate is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub async fn serve(&self, s: &str, body: &str) {
        self.serve_status(s, StatusCode::OK, body).await;
    }

    pub async fn serve_status(&self, s: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .await
            .insert(url(s).to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        let routes = self.routes.lock().await;
        match routes.get(request.url.as_str()) {
            Some((status, body)) => Ok(Response::new(request.url.clone(), *status, body.clone())),
            None => Err(NetError::RequestFailed(format!("no route for {}", request.url))),
        }
    }
}
