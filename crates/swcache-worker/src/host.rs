//! Worker host: owns the registration and drives workers through their lifecycle.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use swcache_net::Origin;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::lifecycle::{
    MessageOutcome, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::worker::{EventOutcome, FetchEvent, MessageEvent, OfflineWorker, WorkerEvent};
use crate::{HandledResponse, ServiceWorkerError};

/// Host events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { scope: String },
    /// A new worker now controls the scope.
    ControllerChange { worker_id: ServiceWorkerId },
    /// Install failed; the worker is redundant.
    InstallFailed {
        worker_id: ServiceWorkerId,
        error: String,
    },
}

struct HostState {
    registration: ServiceWorkerRegistration,
    workers: HashMap<ServiceWorkerId, Arc<OfflineWorker>>,
    retired: HashSet<ServiceWorkerId>,
}

impl HostState {
    fn retire(&mut self, worker: ServiceWorker, events: &mpsc::UnboundedSender<HostEvent>) {
        self.workers.remove(&worker.id);
        self.retired.insert(worker.id);
        let _ = events.send(HostEvent::StateChange {
            worker_id: worker.id,
            new_state: ServiceWorkerState::Redundant,
        });
    }
}

/// Hosts the workers registered for one scope.
pub struct WorkerHost {
    scope: Url,
    state: Arc<RwLock<HostState>>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl WorkerHost {
    /// Create a host for a scope. The scope must be a secure origin.
    pub fn new(
        scope: Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HostEvent>), ServiceWorkerError> {
        if !Origin::from_url(&scope).is_secure() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is not a secure origin",
                scope
            )));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = HostState {
            registration: ServiceWorkerRegistration::new(scope.clone()),
            workers: HashMap::new(),
            retired: HashSet::new(),
        };

        Ok((
            Self {
                scope,
                state: Arc::new(RwLock::new(state)),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Register and install a worker, then activate it if nothing blocks it.
    pub async fn register(
        &self,
        worker: OfflineWorker,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = worker.script_url().clone();
        if !Origin::from_url(&script_url).same_origin(&Origin::from_url(&self.scope)) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {} is not same-origin with scope {}",
                script_url, self.scope
            )));
        }

        let worker = Arc::new(worker);
        let id = {
            let mut state = self.state.write().await;
            let previous = state.registration.installing.as_ref().map(|w| w.id);
            let id = state.registration.begin_install(script_url);
            if let Some(previous) = previous {
                state.workers.remove(&previous);
                state.retired.insert(previous);
            }
            id
        };
        let _ = self.event_tx.send(HostEvent::UpdateFound {
            scope: self.scope.to_string(),
        });
        self.emit_state(id, ServiceWorkerState::Installing);
        info!(worker = id.raw(), scope = %self.scope, "Installing worker");

        // Installs run unlocked; the active worker keeps serving fetches.
        let installed = worker.dispatch(WorkerEvent::Install).await;

        {
            let mut state = self.state.write().await;
            if state.registration.installing.as_ref().map(|w| w.id) != Some(id) {
                state.retired.insert(id);
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} was superseded during install",
                    id.raw()
                )));
            }

            match installed {
                Ok(EventOutcome::Installed(report)) => {
                    debug!(worker = id.raw(), entries = report.entries, "Install complete");
                    if let Some(replaced) = state.registration.install_complete() {
                        state.retire(replaced, &self.event_tx);
                    }
                    state.workers.insert(id, worker);
                    self.emit_state(id, ServiceWorkerState::Installed);
                }
                Ok(other) => {
                    state.registration.install_failed("unexpected install outcome");
                    state.retired.insert(id);
                    return Err(ServiceWorkerError::StateError(format!(
                        "unexpected install outcome {:?}",
                        other
                    )));
                }
                Err(e) => {
                    warn!(worker = id.raw(), error = %e, "Install failed");
                    state.registration.install_failed(e.to_string());
                    state.retired.insert(id);
                    let _ = self.event_tx.send(HostEvent::InstallFailed {
                        worker_id: id,
                        error: e.to_string(),
                    });
                    self.emit_state(id, ServiceWorkerState::Redundant);
                    return Err(e);
                }
            }
        }

        self.try_activate().await?;
        Ok(id)
    }

    /// Activate the waiting worker if it is allowed to. Returns whether it did.
    pub async fn try_activate(&self) -> Result<bool, ServiceWorkerError> {
        let mut state = self.state.write().await;
        if !state.registration.can_activate() {
            return Ok(false);
        }

        let Some(id) = state.registration.waiting.as_ref().map(|w| w.id) else {
            return Ok(false);
        };
        let worker = state
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", id.raw())))?;

        self.emit_state(id, ServiceWorkerState::Activating);
        let navigation_preload = match worker.dispatch(WorkerEvent::Activate).await? {
            EventOutcome::Activated { navigation_preload } => navigation_preload,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "unexpected activate outcome {:?}",
                    other
                )))
            }
        };

        if let Some(previous) = state.registration.activate() {
            state.retire(previous, &self.event_tx);
        }
        state.registration.navigation_preload_enabled = navigation_preload;

        self.emit_state(id, ServiceWorkerState::Activated);
        let _ = self.event_tx.send(HostEvent::ControllerChange { worker_id: id });
        info!(worker = id.raw(), navigation_preload, "Worker now controls scope");
        Ok(true)
    }

    /// A page under the scope opened.
    pub async fn attach_client(&self, client_id: impl Into<String>) -> bool {
        self.state.write().await.registration.attach_client(client_id)
    }

    /// A page closed. The waiting worker may activate once none remain.
    pub async fn detach_client(&self, client_id: &str) -> Result<bool, ServiceWorkerError> {
        let removed = self.state.write().await.registration.detach_client(client_id);
        if removed {
            self.try_activate().await?;
        }
        Ok(removed)
    }

    /// Post a message from a page to the newest worker (waiting, else active).
    pub async fn post_message(
        &self,
        data: serde_json::Value,
    ) -> Result<MessageOutcome, ServiceWorkerError> {
        let (worker, is_waiting) = {
            let state = self.state.read().await;
            let registration = &state.registration;
            let (target, is_waiting) = match (&registration.waiting, &registration.active) {
                (Some(waiting), _) => (waiting.id, true),
                (None, Some(active)) => (active.id, false),
                (None, None) => {
                    return Err(ServiceWorkerError::NotFound(
                        "no worker to receive message".to_string(),
                    ))
                }
            };
            let worker = state
                .workers
                .get(&target)
                .cloned()
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", target.raw())))?;
            (worker, is_waiting)
        };

        let outcome = match worker.dispatch(WorkerEvent::Message(MessageEvent::new(data))).await? {
            EventOutcome::Message(outcome) => outcome,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "unexpected message outcome {:?}",
                    other
                )))
            }
        };

        if outcome == MessageOutcome::SkipWaiting && is_waiting {
            self.state.write().await.registration.skip_waiting();
            self.try_activate().await?;
        }
        Ok(outcome)
    }

    /// Route a fetch to the active worker.
    ///
    /// `Ok(None)` means the fetch is not intercepted: there is no active
    /// worker, or the navigation is outside the scope. An intercepted
    /// navigation that names its client attaches that client.
    pub async fn fetch(
        &self,
        mut event: FetchEvent,
    ) -> Result<Option<HandledResponse>, ServiceWorkerError> {
        let worker = {
            let mut state = self.state.write().await;
            let Some(active_id) = state.registration.active.as_ref().map(|w| w.id) else {
                return Ok(None);
            };
            let navigation = event.request.is_navigation();
            if navigation && !state.registration.in_scope(&event.request.url) {
                debug!(url = %event.request.url, "Navigation outside scope");
                return Ok(None);
            }
            if !state.registration.navigation_preload_enabled {
                event.preload_response = None;
            }
            let worker = match state.workers.get(&active_id) {
                Some(worker) => Arc::clone(worker),
                None => return Ok(None),
            };
            if let (true, Some(client_id)) = (navigation, &event.client_id) {
                if state.registration.attach_client(client_id.clone()) {
                    debug!(client = %client_id, "Client attached by navigation");
                }
            }
            worker
        };

        worker.handle_fetch(event).await.map(Some)
    }

    /// State of a worker this host has seen.
    pub async fn state(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        let state = self.state.read().await;
        if state.retired.contains(&id) {
            return Some(ServiceWorkerState::Redundant);
        }
        state.registration.state_of(id)
    }

    pub async fn active_id(&self) -> Option<ServiceWorkerId> {
        self.state.read().await.registration.active.as_ref().map(|w| w.id)
    }

    pub async fn waiting_id(&self) -> Option<ServiceWorkerId> {
        self.state.read().await.registration.waiting.as_ref().map(|w| w.id)
    }

    pub async fn navigation_preload_enabled(&self) -> bool {
        self.state.read().await.registration.navigation_preload_enabled
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.registration.client_count()
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        let _ = self.event_tx.send(HostEvent::StateChange {
            worker_id,
            new_state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::store::{CacheStore, MemoryCacheStore};
    use crate::test_support::{url, MockFetcher, ORIGIN};
    use crate::worker::WorkerCapabilities;
    use crate::ResponseSource;
    use futures::FutureExt;
    use http::StatusCode;
    use serde_json::json;
    use swcache_net::{NetError, Request, Response};

    fn scope() -> Url {
        Url::parse(ORIGIN).unwrap()
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            precache: vec!["/".to_string()],
            ..WorkerConfig::for_origin(scope())
        }
    }

    async fn fetcher() -> Arc<MockFetcher> {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.serve("/", "home").await;
        fetcher.serve("/404", "offline").await;
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

    fn drain(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> Vec<HostEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_insecure_scope_rejected() {
        let result = WorkerHost::new(Url::parse("http://example.com/").unwrap());
        assert!(matches!(result, Err(ServiceWorkerError::SecurityError(_))));
        assert!(WorkerHost::new(Url::parse("http://localhost:5000/").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_first_worker_activates_immediately() {
        let (host, mut rx) = WorkerHost::new(scope()).unwrap();
        let store = Arc::new(MemoryCacheStore::new());

        let id = host.register(worker(store, fetcher().await, true)).await.unwrap();

        assert_eq!(host.active_id().await, Some(id));
        assert_eq!(host.state(id).await, Some(ServiceWorkerState::Activated));
        assert!(host.navigation_preload_enabled().await);

        let events = drain(&mut rx);
        assert!(matches!(events[0], HostEvent::UpdateFound { .. }));
        assert!(events.contains(&HostEvent::StateChange {
            worker_id: id,
            new_state: ServiceWorkerState::Installed
        }));
        assert_eq!(events.last(), Some(&HostEvent::ControllerChange { worker_id: id }));
    }

    #[tokio::test]
    async fn test_failed_install_makes_worker_redundant() {
        let (host, mut rx) = WorkerHost::new(scope()).unwrap();
        let fetcher = fetcher().await;
        fetcher.set_offline(true);
        let store = Arc::new(MemoryCacheStore::new());

        let result = host.register(worker(store.clone(), fetcher, true)).await;
        assert!(result.is_err());
        assert!(host.active_id().await.is_none());
        assert!(store.keys(&config().cache_name).await.unwrap().is_empty());

        let events = drain(&mut rx);
        let failed = events
            .iter()
            .find_map(|e| match e {
                HostEvent::InstallFailed { worker_id, .. } => Some(*worker_id),
                _ => None,
            })
            .unwrap();
        assert_eq!(host.state(failed).await, Some(ServiceWorkerState::Redundant));
    }

    #[tokio::test]
    async fn test_update_waits_for_clients_then_skip_waiting() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = fetcher().await;

        let v1 = host.register(worker(store.clone(), fetcher.clone(), true)).await.unwrap();
        host.attach_client("tab-1").await;

        let v2 = host.register(worker(store, fetcher, true)).await.unwrap();
        assert_eq!(host.active_id().await, Some(v1));
        assert_eq!(host.waiting_id().await, Some(v2));
        assert_eq!(host.state(v2).await, Some(ServiceWorkerState::Installed));

        let outcome = host.post_message(json!({"type": "SKIP_WAITING"})).await.unwrap();
        assert_eq!(outcome, MessageOutcome::SkipWaiting);
        assert_eq!(host.active_id().await, Some(v2));
        assert_eq!(host.state(v1).await, Some(ServiceWorkerState::Redundant));
        assert_eq!(host.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_closing_last_client_activates_waiting_worker() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = fetcher().await;

        host.register(worker(store.clone(), fetcher.clone(), true)).await.unwrap();
        host.attach_client("tab-1").await;
        let v2 = host.register(worker(store, fetcher, true)).await.unwrap();
        assert_eq!(host.waiting_id().await, Some(v2));

        assert!(host.detach_client("tab-1").await.unwrap());
        assert_eq!(host.active_id().await, Some(v2));
        assert!(host.waiting_id().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_message_leaves_waiting_worker() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        assert!(matches!(
            host.post_message(json!({"type": "SKIP_WAITING"})).await,
            Err(ServiceWorkerError::NotFound(_))
        ));

        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = fetcher().await;
        host.register(worker(store.clone(), fetcher.clone(), true)).await.unwrap();
        host.attach_client("tab-1").await;
        let v2 = host.register(worker(store, fetcher, true)).await.unwrap();

        let outcome = host.post_message(json!({"type": "RELOAD"})).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Ignored);
        assert_eq!(host.waiting_id().await, Some(v2));
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_is_not_intercepted() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        let handled = host.fetch(FetchEvent::new(Request::get(url("/")))).await.unwrap();
        assert!(handled.is_none());
    }

    #[tokio::test]
    async fn test_navigation_outside_scope_is_not_intercepted() {
        let (host, _rx) = WorkerHost::new(url("/blog/")).unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        host.register(worker(store, fetcher().await, false)).await.unwrap();

        let outside = host.fetch(FetchEvent::new(Request::navigate(url("/")))).await.unwrap();
        assert!(outside.is_none());

        let asset = host.fetch(FetchEvent::new(Request::get(url("/")))).await.unwrap();
        assert!(asset.is_some());
    }

    #[tokio::test]
    async fn test_navigation_attaches_its_client() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = fetcher().await;
        host.register(worker(store.clone(), fetcher.clone(), false)).await.unwrap();

        let asset = FetchEvent::new(Request::get(url("/"))).with_client("tab-0");
        host.fetch(asset).await.unwrap().unwrap();
        assert_eq!(host.client_count().await, 0);

        let page = FetchEvent::new(Request::navigate(url("/"))).with_client("tab-1");
        host.fetch(page).await.unwrap().unwrap();
        assert_eq!(host.client_count().await, 1);

        // The attached page now holds a new version in waiting.
        let v2 = host.register(worker(store, fetcher, false)).await.unwrap();
        assert_eq!(host.waiting_id().await, Some(v2));
        assert!(host.detach_client("tab-1").await.unwrap());
        assert_eq!(host.active_id().await, Some(v2));
    }

    #[tokio::test]
    async fn test_preload_dropped_when_registration_has_it_disabled() {
        let (host, _rx) = WorkerHost::new(scope()).unwrap();
        let store = Arc::new(MemoryCacheStore::new());
        host.register(worker(store, fetcher().await, false)).await.unwrap();
        assert!(!host.navigation_preload_enabled().await);

        let preload = async {
            Ok::<_, NetError>(Some(Response::new(url("/"), StatusCode::OK, "preloaded")))
        }
        .boxed();
        let event = FetchEvent::new(Request::navigate(url("/"))).with_preload(preload);
        let handled = host.fetch(event).await.unwrap().unwrap();

        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.body().as_ref(), b"home");
    }
}
