//! Events pushed to dashboard clients
//!
//! Wire format is `{"type": "<name>", "payload": <value>}`.

use crate::config::Config;
use crate::routes::{slugify, RouteRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health of every app keyed by slug
pub type HealthMap = BTreeMap<String, HealthSummary>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    ConfigUpdated(ConfigSnapshot),
    HealthChanged(HealthMap),
    AppHealthChanged(AppHealth),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ConfigUpdated(_) => "config_updated",
            Event::HealthChanged(_) => "health_changed",
            Event::AppHealthChanged(_) => "app_health_changed",
        }
    }
}

/// What the dashboard shows about one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppView {
    pub name: String,
    pub slug: String,
    pub url: String,
    /// Present only while the app's route is registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Client-facing view of the current configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub title: String,
    pub apps: Vec<AppView>,
}

impl ConfigSnapshot {
    /// Build the view of enabled apps, attaching proxy URLs from the registry
    pub fn build(config: &Config, routes: &RouteRegistry) -> Self {
        let apps = config
            .apps
            .iter()
            .filter(|app| app.enabled)
            .map(|app| {
                let slug = slugify(&app.name);
                AppView {
                    proxy_url: routes.get_proxy_url(&slug),
                    name: app.name.clone(),
                    slug,
                    url: app.url.clone(),
                    icon: app.icon.clone(),
                    description: app.description.clone(),
                }
            })
            .collect();

        Self {
            title: config.title.clone(),
            apps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Result of the latest probe of one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSummary {
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            status_code: None,
            latency_ms: None,
            error: None,
            checked_at: Utc::now(),
        }
    }
}

/// Payload of `app_health_changed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHealth {
    pub app: String,
    pub health: HealthSummary,
}
