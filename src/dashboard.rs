//! Dashboard server on the internal address
//!
//! The proxy engine forwards every browser request here. Routes:
//!
//! - `GET /` status page
//! - `GET /api/apps` current [`ConfigSnapshot`]
//! - `GET /api/health` latest health per app
//! - `GET /healthz` liveness
//! - `GET /ws` WebSocket event stream

use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::events::ConfigSnapshot;
use crate::healthcheck::SharedHealth;
use crate::hub::EventHub;
use crate::routes::{AppRoute, RouteRegistry};
use crate::ws;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

type DashboardBody = BoxBody<Bytes, hyper::Error>;

/// State the dashboard serves, shared with the reload path and the health checker
pub struct DashboardState {
    routes: Arc<RouteRegistry>,
    hub: EventHub,
    health: SharedHealth,
    snapshot: RwLock<ConfigSnapshot>,
}

impl DashboardState {
    pub fn new(routes: Arc<RouteRegistry>, hub: EventHub, health: SharedHealth) -> Self {
        Self {
            routes,
            hub,
            health,
            snapshot: RwLock::new(ConfigSnapshot::default()),
        }
    }

    /// Replace the routes with `config`'s apps and rebuild the snapshot
    pub fn apply(&self, config: &Config) -> ConfigSnapshot {
        self.routes.set_routes(config.apps.iter().map(AppRoute::from));
        let snapshot = ConfigSnapshot::build(config, &self.routes);
        *self.snapshot.write() = snapshot.clone();
        debug!(apps = snapshot.apps.len(), routes = self.routes.len(), "Dashboard configuration applied");
        snapshot
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.read().clone()
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }
}

pub struct DashboardServer {
    listener: TcpListener,
    state: Arc<DashboardState>,
}

impl DashboardServer {
    pub async fn bind(addr: &str, state: Arc<DashboardState>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind dashboard on {}: {}", addr, e))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Dashboard listening");
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Dashboard connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept dashboard connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Dashboard shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<DashboardState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_request(req, state)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn handle_request(req: Request<Incoming>, state: Arc<DashboardState>) -> Response<DashboardBody> {
    debug!(method = %req.method(), path = %req.uri().path(), "Dashboard request");

    if req.method() == Method::GET && req.uri().path() == "/ws" {
        return ws::accept(req, state.hub.clone());
    }

    route(req.method(), req.uri().path(), &state)
}

fn route(method: &Method, path: &str, state: &DashboardState) -> Response<DashboardBody> {
    match (method, path) {
        (&Method::GET, "/") => response(StatusCode::OK, "text/html; charset=utf-8", STATUS_PAGE),
        (&Method::GET, "/healthz") => response(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/api/apps") => json(&state.snapshot()),
        (&Method::GET, "/api/health") => {
            let health = state.health.read().clone();
            json(&health)
        }
        _ => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<DashboardBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn json<T: serde::Serialize>(value: &T) -> Response<DashboardBody> {
    match serde_json::to_string(value) {
        Ok(body) => response(StatusCode::OK, "application/json", body),
        Err(e) => {
            error!(error = %e, "Failed to encode dashboard response");
            json_error_response(ProxyErrorCode::InternalError, "Failed to encode response")
        }
    }
}

const STATUS_PAGE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Homepane</title>
    <style>
        body { font-family: system-ui, sans-serif; background: #111827; color: #e5e7eb; margin: 0; padding: 2rem; }
        h1 { font-weight: 600; margin: 0 0 1.5rem; }
        #apps { display: grid; grid-template-columns: repeat(auto-fill, minmax(220px, 1fr)); gap: 1rem; }
        .app { background: #1f2937; border-radius: 8px; padding: 1rem; text-decoration: none; color: inherit; }
        .app .name { font-weight: 600; }
        .app .desc { color: #9ca3af; font-size: 0.875rem; margin-top: 0.25rem; }
        .dot { display: inline-block; width: 0.6rem; height: 0.6rem; border-radius: 50%; margin-right: 0.5rem; background: #6b7280; }
        .healthy .dot { background: #10b981; }
        .unhealthy .dot { background: #ef4444; }
        #conn { position: fixed; bottom: 1rem; right: 1rem; font-size: 0.75rem; color: #6b7280; }
    </style>
</head>
<body>
    <h1 id="title">Homepane</h1>
    <div id="apps"></div>
    <div id="conn">connecting</div>
    <script>
        const state = { config: { title: 'Homepane', apps: [] }, health: {} };

        function render() {
            document.title = state.config.title;
            document.getElementById('title').textContent = state.config.title;
            const apps = document.getElementById('apps');
            apps.replaceChildren(...state.config.apps.map(app => {
                const card = document.createElement('a');
                const health = state.health[app.slug];
                card.className = 'app ' + (health ? health.status : 'unknown');
                card.href = app.url;
                card.target = '_blank';
                const name = document.createElement('div');
                name.className = 'name';
                name.innerHTML = '<span class="dot"></span>';
                name.append(app.name);
                card.append(name);
                if (app.description) {
                    const desc = document.createElement('div');
                    desc.className = 'desc';
                    desc.textContent = app.description;
                    card.append(desc);
                }
                return card;
            }));
        }

        async function load() {
            const [config, health] = await Promise.all([
                fetch('/api/apps').then(r => r.json()),
                fetch('/api/health').then(r => r.json()),
            ]);
            state.config = config;
            state.health = health;
            render();
        }

        function connect() {
            const proto = location.protocol === 'https:' ? 'wss:' : 'ws:';
            const socket = new WebSocket(proto + '//' + location.host + '/ws');
            const conn = document.getElementById('conn');
            socket.onopen = () => { conn.textContent = 'live'; };
            socket.onclose = () => { conn.textContent = 'reconnecting'; setTimeout(connect, 3000); };
            socket.onmessage = (msg) => {
                const event = JSON.parse(msg.data);
                if (event.type === 'config_updated') state.config = event.payload;
                if (event.type === 'health_changed') state.health = event.payload;
                if (event.type === 'app_health_changed') state.health[event.payload.app] = event.payload.health;
                render();
            };
        }

        load().catch(console.error);
        connect();
    </script>
</body>
</html>
"##;
