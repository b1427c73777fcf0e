//! Engine admin endpoint
//!
//! Served only when the loaded document leaves the admin API on (plain mode). Exposes the
//! rendered configuration the engine is running plus basic liveness and counters.

use crate::document::ProxyDocument;
use crate::pool::PoolStats;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What the admin endpoint reports about one loaded document
pub struct AdminState {
    pub document: ProxyDocument,
    pub stats: Arc<PoolStats>,
    pub loaded_at: DateTime<Utc>,
}

pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(listener: TcpListener, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Engine admin endpoint listening");
        }

        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Admin endpoint shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(route(req.method(), req.uri().path(), &state)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn route(method: &Method, path: &str, state: &AdminState) -> Response<Full<Bytes>> {
    debug!(%method, path, "Admin request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let body = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/config") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(state.document.render())))
            .expect("valid response with StatusCode enum and static header"),

        (&Method::GET, "/stats") => {
            let body = serde_json::json!({
                "mode": state.document.mode.name(),
                "site": state.document.site.address,
                "upstream": state.document.upstream(),
                "import": state.document.import,
                "loaded_at": state.loaded_at,
                "forwarded": state.stats.forwarded(),
                "failed": state.stats.failed(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (_, "/health" | "/version" | "/config" | "/stats") => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
