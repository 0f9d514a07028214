//! Request routing: navigations first, then the registered routes in order.

use http::Method;
use swcache_net::{Request, UrlPattern};
use tracing::trace;

/// Strategy a route hands its requests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHandler {
    StaleWhileRevalidate,
}

/// A pattern + method bound to a handler.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: UrlPattern,
    pub method: Method,
    pub handler: RouteHandler,
}

impl Route {
    pub fn new(pattern: UrlPattern, method: Method, handler: RouteHandler) -> Self {
        Self {
            pattern,
            method,
            handler,
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        request.method == self.method && self.pattern.matches(&request.url)
    }
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Top-level navigation.
    Navigation,
    /// Matched a registered route.
    Handler(RouteHandler),
    /// No route matched; straight to the network.
    Passthrough,
}

/// Ordered route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Empty router; everything but navigations passes through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Earlier routes win.
    pub fn register(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Decide how to handle a request.
    pub fn route(&self, request: &Request) -> RouteDecision {
        if request.is_navigation() {
            return RouteDecision::Navigation;
        }

        let decision = self
            .routes
            .iter()
            .find(|route| route.matches(request))
            .map(|route| RouteDecision::Handler(route.handler))
            .unwrap_or(RouteDecision::Passthrough);

        trace!(url = %request.url, method = %request.method, ?decision, "Routed request");
        decision
    }
}
