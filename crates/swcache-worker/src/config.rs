//! Worker configuration

use std::path::Path;

use http::Method;
use serde::{Deserialize, Serialize};
use swcache_common::SwCacheError;
use swcache_net::UrlPattern;
use url::Url;

use crate::precache::PrecacheManifest;
use crate::router::{Route, RouteHandler, Router};
use crate::ServiceWorkerError;

/// Default cache name. Changing it is how a deploy invalidates old caches.
pub const DEFAULT_CACHE_NAME: &str = "pwabuilder-offline-page";

/// Default offline fallback page.
pub const DEFAULT_OFFLINE_FALLBACK: &str = "/404";

/// Assets precached on install, in order.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/404",
    "/assets/bootstrap/css/bootstrap.min.css",
    "https://fonts.googleapis.com/css?family=Lora:400,700,400italic,700italic&display=swap",
    "https://fonts.googleapis.com/css?family=Cabin:700&display=swap",
    "https://fonts.googleapis.com/css?family=Anonymous+Pro&display=swap",
    "https://fonts.googleapis.com/css?family=Roboto:300,400,500,700",
    "/assets/css/styles.min.css",
    "/assets/css/404.min.css",
    "/assets/css/profile.min.css",
    "/assets/bootstrap/js/bootstrap.min.js",
    "/assets/js/script.min.js",
    "/assets/js/404.min.js",
    "/assets/img/favicon/favicon-16x16.png",
    "/assets/img/favicon/android-chrome-192x192.png",
];

/// URL patterns served stale-while-revalidate. `/*` takes every GET.
pub const DEFAULT_ROUTES: &[&str] = &["/*"];

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the cache store
    pub cache_name: String,

    /// Site origin; relative manifest entries resolve against it
    pub origin: Url,

    /// Worker script path, relative to the origin
    pub script: String,

    /// Precache manifest
    pub precache: Vec<String>,

    /// Page served when a navigation fails
    pub offline_fallback: String,

    /// Use navigation preload when the runtime supports it
    pub navigation_preload: bool,

    /// Regex URL patterns for GET requests served stale-while-revalidate,
    /// checked in order
    pub routes: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            origin: Url::parse("http://localhost:5000/").expect("static origin parses"),
            script: "/sw.js".to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            offline_fallback: DEFAULT_OFFLINE_FALLBACK.to_string(),
            navigation_preload: true,
            routes: DEFAULT_ROUTES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration for another origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, SwCacheError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwCacheError::config_with_source("parsing worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SwCacheError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SwCacheError::config_with_source(format!("reading {}", path.display()), e)
        })?;
        Self::from_json(&contents)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), SwCacheError> {
        if self.cache_name.trim().is_empty() {
            return Err(SwCacheError::config("cache_name must not be empty"));
        }
        if self.origin.cannot_be_a_base() {
            return Err(SwCacheError::config(format!(
                "origin {} cannot resolve relative paths",
                self.origin
            )));
        }
        self.resolve(&self.offline_fallback)?;
        self.resolve(&self.script)?;
        for entry in &self.precache {
            self.resolve(entry)?;
        }
        self.router()?;
        Ok(())
    }

    /// Resolve a manifest entry against the origin.
    pub fn resolve(&self, entry: &str) -> Result<Url, SwCacheError> {
        self.origin
            .join(entry)
            .map_err(|e| SwCacheError::config_with_source(format!("bad url '{}'", entry), e))
    }

    /// Worker script URL.
    pub fn script_url(&self) -> Result<Url, SwCacheError> {
        self.resolve(&self.script)
    }

    /// Route table for sub-resource requests.
    pub fn router(&self) -> Result<Router, SwCacheError> {
        let mut router = Router::new();
        for source in &self.routes {
            let pattern = UrlPattern::regex(source).map_err(|e| {
                SwCacheError::config_with_source(format!("bad route '{}'", source), e)
            })?;
            router.register(Route::new(
                pattern,
                Method::GET,
                RouteHandler::StaleWhileRevalidate,
            ));
        }
        Ok(router)
    }

    /// Build the precache manifest.
    pub fn manifest(&self) -> Result<PrecacheManifest, ServiceWorkerError> {
        PrecacheManifest::new(&self.origin, &self.precache, &self.offline_fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_name, DEFAULT_CACHE_NAME);
        assert_eq!(config.precache.len(), 15);
        assert!(config.precache.contains(&config.offline_fallback));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = WorkerConfig::from_json(
            r#"{"cache_name": "site-v2", "origin": "https://example.com/"}"#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "site-v2");
        assert_eq!(config.offline_fallback, "/404");
        assert_eq!(
            config.manifest().unwrap().offline_fallback().as_str(),
            "https://example.com/404"
        );
        assert_eq!(config.routes, vec!["/*".to_string()]);
    }

    #[test]
    fn test_empty_cache_name_rejected() {
        let err = WorkerConfig::from_json(r#"{"cache_name": "  "}"#).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_routes_from_json() {
        let config = WorkerConfig::from_json(
            r#"{"origin": "https://example.com/", "routes": ["/assets/", "\\.png$"]}"#,
        )
        .unwrap();
        let router = config.router().unwrap();
        assert_eq!(router.routes().len(), 2);
        assert_eq!(router.routes()[1].pattern.as_str(), r"\.png$");
    }

    #[test]
    fn test_invalid_route_rejected() {
        let err = WorkerConfig::from_json(r#"{"routes": ["(unclosed"]}"#).unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(WorkerConfig::from_json("{cache_name:").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sw.json");
        std::fs::write(&path, r#"{"navigation_preload": false}"#).unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert!(!config.navigation_preload);

        assert!(WorkerConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_cross_origin_entries_resolve_as_absolute() {
        let config = WorkerConfig::for_origin(Url::parse("https://example.com/").unwrap());
        let font = config
            .resolve("https://fonts.googleapis.com/css?family=Cabin:700&display=swap")
            .unwrap();
        assert_eq!(font.host_str(), Some("fonts.googleapis.com"));
    }
}
