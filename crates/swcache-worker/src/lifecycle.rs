//! Worker lifecycle: registration slots, clients and the skip-waiting message.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker version known to a registration.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            error: None,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }
}

// ==================== Registration ====================

/// A service worker registration for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Navigation preload enabled.
    pub navigation_preload_enabled: bool,

    /// The waiting worker asked to skip waiting.
    skip_waiting: bool,

    /// Pages controlled by the active worker.
    clients: HashSet<String>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            navigation_preload_enabled: false,
            skip_waiting: false,
            clients: HashSet::new(),
        }
    }

    /// Check if a URL falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing a new worker version.
    pub fn begin_install(&mut self, script_url: Url) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(script_url);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        if let Some(mut previous) = self.installing.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Transition installing to waiting. Returns any waiting worker it replaced.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        self.skip_waiting = false;
        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Mark the installing worker redundant after a failed install.
    pub fn install_failed(&mut self, error: impl Into<String>) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error.into());
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Request immediate activation of the waiting worker.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Check if the waiting worker may activate now.
    ///
    /// It may when nothing is active, when no page is controlled, or when it
    /// asked to skip waiting.
    pub fn can_activate(&self) -> bool {
        self.waiting.is_some()
            && (self.active.is_none() || self.clients.is_empty() || self.skip_waiting)
    }

    /// Activate waiting worker. Returns the superseded worker, if any.
    pub fn activate(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let previous = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        worker.set_state(ServiceWorkerState::Activated);
        self.active = Some(worker);
        self.skip_waiting = false;
        previous
    }

    /// Register a page controlled by this scope.
    pub fn attach_client(&mut self, client_id: impl Into<String>) -> bool {
        self.clients.insert(client_id.into())
    }

    /// Forget a closed page.
    pub fn detach_client(&mut self, client_id: &str) -> bool {
        self.clients.remove(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// State of a worker in any slot.
    pub fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.state)
    }
}

// ==================== Messages ====================

/// Commands a controlled page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleMessage {
    /// `{"type": "SKIP_WAITING"}`
    SkipWaiting,
}

impl LifecycleMessage {
    /// Parse a message payload; `None` for anything unrecognized.
    pub fn parse(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// What the worker asks of the runtime after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Activate this worker without waiting for pages to close.
    SkipWaiting,
    /// Not a recognized command.
    Ignored,
}

/// Handles messages posted by controlled pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct LifecycleController;

impl LifecycleController {
    pub fn new() -> Self {
        Self
    }

    /// Interpret a message payload. Never fails; there is no reply.
    pub fn handle_message(&self, payload: &serde_json::Value) -> MessageOutcome {
        match LifecycleMessage::parse(payload) {
            Some(LifecycleMessage::SkipWaiting) => {
                debug!("Skip waiting requested");
                MessageOutcome::SkipWaiting
            }
            None => {
                debug!(payload = %payload, "Ignoring unrecognized message");
                MessageOutcome::Ignored
            }
        }
    }
}
