//! Registry of enabled app routes
//!
//! Routes exist for URL generation only. The proxy forwards every request to the
//! internal upstream regardless of what is registered here.

use crate::config::AppConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Prefix of every generated proxy URL
const PROXY_PATH_PREFIX: &str = "/proxy/";

/// An application reachable through the dashboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRoute {
    pub name: String,
    pub slug: String,
    pub target_url: String,
    pub enabled: bool,
}

impl AppRoute {
    /// Create a route, deriving the slug from the display name
    pub fn new(name: &str, target_url: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            slug: slugify(name),
            target_url: target_url.to_string(),
            enabled,
        }
    }
}

impl From<&AppConfig> for AppRoute {
    fn from(app: &AppConfig) -> Self {
        AppRoute::new(&app.name, &app.url, app.enabled)
    }
}

/// Derive a URL-safe slug from a display name.
///
/// Lower-cases, turns spaces into hyphens, then drops everything outside
/// `[a-z0-9-]`. Repeated hyphens are kept as-is.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Build the canonical proxy path for a slug
pub fn proxy_path(slug: &str) -> String {
    format!("{}{}/", PROXY_PATH_PREFIX, slug)
}

/// Thread-safe store of enabled routes keyed by slug
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, AppRoute>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire route set. Disabled routes are dropped; on slug
    /// collision the later route wins.
    pub fn set_routes<I>(&self, routes: I)
    where
        I: IntoIterator<Item = AppRoute>,
    {
        let next: HashMap<String, AppRoute> = routes
            .into_iter()
            .filter(|route| route.enabled)
            .map(|route| (route.slug.clone(), route))
            .collect();

        debug!(count = next.len(), "Route set replaced");
        *self.routes.write() = next;
    }

    /// Proxy URL for a registered slug, `None` when no route is available
    pub fn get_proxy_url(&self, slug: &str) -> Option<String> {
        self.routes
            .read()
            .contains_key(slug)
            .then(|| proxy_path(slug))
    }

    pub fn get(&self, slug: &str) -> Option<AppRoute> {
        self.routes.read().get(slug).cloned()
    }

    /// Snapshot of all routes ordered by slug
    pub fn routes(&self) -> Vec<AppRoute> {
        let mut routes: Vec<AppRoute> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.slug.cmp(&b.slug));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
