//! Periodic health probes of the registered apps
//!
//! Every interval each registered route's target URL gets a GET. An app changes status
//! only after `failure_threshold` consecutive failures or `success_threshold` consecutive
//! successes. Transitions are pushed to the hub as `app_health_changed`, followed by one
//! `health_changed` carrying the whole map.

use crate::config::HealthConfig;
use crate::events::{HealthMap, HealthStatus, HealthSummary};
use crate::hub::EventHub;
use crate::routes::{AppRoute, RouteRegistry};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Latest health of every app, shared with the dashboard API
pub type SharedHealth = Arc<RwLock<HealthMap>>;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Consecutive results for one app
#[derive(Debug)]
struct AppHealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    status: HealthStatus,
}

impl Default for AppHealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: HealthStatus::Unknown,
        }
    }
}

impl AppHealthState {
    /// Record a probe; returns true when the status changed
    fn record(&mut self, ok: bool, config: &HealthConfig) -> bool {
        let next = if ok {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            (self.consecutive_successes >= config.success_threshold.max(1)).then_some(HealthStatus::Healthy)
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            (self.consecutive_failures >= config.failure_threshold.max(1)).then_some(HealthStatus::Unhealthy)
        };

        match next {
            Some(status) if status != self.status => {
                self.status = status;
                true
            }
            _ => false,
        }
    }
}

pub struct HealthChecker {
    routes: Arc<RouteRegistry>,
    hub: EventHub,
    board: SharedHealth,
    config: HealthConfig,
    client: reqwest::Client,
    states: HashMap<String, AppHealthState>,
}

impl HealthChecker {
    pub fn new(
        routes: Arc<RouteRegistry>,
        hub: EventHub,
        board: SharedHealth,
        config: HealthConfig,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            routes,
            hub,
            board,
            config,
            client,
            states: HashMap::new(),
        })
    }

    /// Probe immediately, then every interval until shutdown
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            failure_threshold = self.config.failure_threshold,
            "Health checker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One round of probes over the current routes
    pub async fn check_all(&mut self) {
        let routes = self.routes.routes();

        let probes = routes.iter().map(|route| self.probe(route));
        let results = futures::future::join_all(probes).await;

        let mut transitions = Vec::new();
        let mut map = HealthMap::new();
        for (route, result) in routes.iter().zip(results) {
            let state = self.states.entry(route.slug.clone()).or_default();
            let changed = state.record(result.ok, &self.config);

            let summary = HealthSummary {
                status: state.status,
                status_code: result.status_code,
                latency_ms: Some(result.latency_ms),
                error: result.error,
                checked_at: Utc::now(),
            };

            if changed {
                match state.status {
                    HealthStatus::Unhealthy => warn!(
                        app = %route.slug,
                        failures = state.consecutive_failures,
                        "App is now unhealthy"
                    ),
                    _ => info!(app = %route.slug, "App is now healthy"),
                }
                transitions.push((route.slug.clone(), summary.clone()));
            }
            map.insert(route.slug.clone(), summary);
        }

        let before = self.states.len();
        self.states.retain(|slug, _| map.contains_key(slug));
        let removed = before != self.states.len();

        *self.board.write() = map.clone();

        for (slug, summary) in transitions.iter() {
            if let Err(e) = self.hub.broadcast_app_health_update(slug, summary.clone()).await {
                debug!(error = %e, "Hub closed; dropping health update");
                return;
            }
        }
        if !transitions.is_empty() || removed {
            if let Err(e) = self.hub.broadcast_health_update(map).await {
                debug!(error = %e, "Hub closed; dropping health update");
            }
        }
    }

    async fn probe(&self, route: &AppRoute) -> ProbeResult {
        let started = Instant::now();
        let result = self.client.get(&route.target_url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status();
                debug!(app = %route.slug, status = status.as_u16(), latency_ms, "Health probe");
                ProbeResult {
                    ok: !status.is_server_error(),
                    status_code: Some(status.as_u16()),
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                debug!(app = %route.slug, error = %e, "Health probe failed");
                ProbeResult {
                    ok: false,
                    status_code: None,
                    latency_ms,
                    error: Some(if e.is_timeout() {
                        "timeout".to_string()
                    } else {
                        e.to_string()
                    }),
                }
            }
        }
    }
}
