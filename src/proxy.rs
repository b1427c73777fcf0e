//! Embedded reverse-proxy engine
//!
//! [`EmbeddedEngine`] serves a [`ProxyDocument`]: it binds the listeners the document's TLS
//! mode calls for, forwards every request to the single upstream (or to a gateway site
//! chosen by Host), sets the forwarded headers, and passes protocol upgrades through as
//! raw byte streams.
//!
//! | mode      | listeners                                                         |
//! |-----------|-------------------------------------------------------------------|
//! | plain     | site address, HTTP                                                |
//! | manual    | site address, HTTPS from the configured PEM files                 |
//! | automatic | `https_port` with ACME certificates, `http_port` for HTTP-01 and redirects |
//!
//! The admin endpoint runs alongside when the document does not turn it off.

use crate::acme::{AcmeManager, AcmeSettings, Http01Challenges, ACME_TLS_ALPN_NAME};
use crate::admin::{AdminServer, AdminState};
use crate::config::EngineConfig;
use crate::document::{ForwardedHeader, ProxyDocument, TlsMode};
use crate::engine::{EngineError, ProxyEngine};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::gateway::{strip_port, GatewaySites};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::tls;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_REQUEST_ID: &str = "x-request-id";

/// How long listeners get to wind down on stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on an upstream's response head during an upgrade
const MAX_UPGRADE_HEAD_LEN: usize = 16 * 1024;

/// Addresses the running instance is bound to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    /// Site listener (HTTPS listener in automatic mode)
    pub site: Option<SocketAddr>,
    /// Challenge and redirect listener, automatic mode only
    pub http: Option<SocketAddr>,
    pub admin: Option<SocketAddr>,
}

/// Where a request goes, derived from one document
struct Routing {
    upstream: String,
    headers: Vec<ForwardedHeader>,
    gateway: GatewaySites,
    /// Only this host (plus gateway hosts) is served; `None` serves every host
    site_host: Option<String>,
}

impl Routing {
    fn new(document: &ProxyDocument, gateway: GatewaySites) -> Self {
        let site_host = match &document.mode {
            TlsMode::Automatic { domain, .. } => Some(domain.to_lowercase()),
            _ => None,
        };

        Self {
            upstream: document.upstream().to_string(),
            headers: document.site.reverse_proxy.headers.clone(),
            gateway,
            site_host,
        }
    }

    fn resolve(&self, host: Option<&str>) -> Result<&str, ProxyErrorCode> {
        if let Some(upstream) = host.and_then(|h| self.gateway.lookup(h)) {
            return Ok(upstream);
        }

        match (&self.site_host, host) {
            (None, _) => Ok(&self.upstream),
            (Some(_), None) => Err(ProxyErrorCode::BadRequest),
            (Some(site), Some(host)) if strip_port(host).eq_ignore_ascii_case(site) => Ok(&self.upstream),
            (Some(_), Some(_)) => Err(ProxyErrorCode::UnknownHost),
        }
    }
}

/// Per-listener request handling settings
#[derive(Clone)]
struct ListenerContext {
    routing: Arc<Routing>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    /// Redirect everything (except ACME challenges) to HTTPS on this port
    redirect_port: Option<u16>,
    challenges: Option<Http01Challenges>,
}

struct Listener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: ListenerContext,
}

/// One loaded document and the tasks serving it
struct Instance {
    document: ProxyDocument,
    addrs: BoundAddrs,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Instance {
    async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks;

        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    warn!(error = %e, "Engine task ended abnormally");
                }
            }
        })
        .await;

        if joined.is_err() {
            for task in &tasks {
                task.abort();
            }
            return Err(EngineError::Shutdown(format!(
                "listeners did not stop within {}s",
                SHUTDOWN_TIMEOUT.as_secs()
            )));
        }

        debug!(site = %self.document.site.address, "Engine instance stopped");
        Ok(())
    }
}

/// The default [`ProxyEngine`]
pub struct EmbeddedEngine {
    config: EngineConfig,
    pool: Arc<ConnectionPool>,
    instance: Mutex<Option<Instance>>,
}

impl EmbeddedEngine {
    pub fn new(config: EngineConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }));

        Self {
            config,
            pool,
            instance: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    /// Bound addresses of the running instance; all `None` when stopped
    pub async fn bound_addrs(&self) -> BoundAddrs {
        self.instance
            .lock()
            .await
            .as_ref()
            .map(|i| i.addrs.clone())
            .unwrap_or_default()
    }

    /// The document currently being served
    pub async fn document(&self) -> Option<ProxyDocument> {
        self.instance.lock().await.as_ref().map(|i| i.document.clone())
    }

    async fn spawn(&self, document: &ProxyDocument) -> Result<Instance, EngineError> {
        let gateway = match &document.import {
            Some(path) => GatewaySites::load(path)?,
            None => GatewaySites::default(),
        };
        if !gateway.is_empty() {
            info!(sites = ?gateway.hosts(), "Gateway sites imported");
        }

        let base = ListenerContext {
            routing: Arc::new(Routing::new(document, gateway)),
            pool: Arc::clone(&self.pool),
            request_timeout: self.config.request_timeout(),
            redirect_port: None,
            challenges: None,
        };

        // Bind everything before spawning so a failed bind leaves nothing running
        let mut listeners = Vec::new();
        let mut acme = None;

        match &document.mode {
            TlsMode::Plain => {
                listeners.push(Listener {
                    listener: bind(&listen_addr(&document.site.address)?).await?,
                    tls: None,
                    context: base,
                });
            }
            TlsMode::Manual { cert, key } => {
                let acceptor = tls::manual_acceptor(cert, key)?;
                listeners.push(Listener {
                    listener: bind(&listen_addr(&document.site.address)?).await?,
                    tls: Some(acceptor),
                    context: base,
                });
            }
            TlsMode::Automatic { .. } => {
                let settings = AcmeSettings::for_document(document, &self.config, &base.routing.gateway)
                    .ok_or_else(|| EngineError::Acme("document is not in automatic mode".to_string()))?;
                let manager = Arc::new(AcmeManager::new(settings)?);
                if !manager.load_cached() {
                    info!(domains = ?manager.settings().domains, "No usable cached certificate; requesting one");
                }

                let acceptor = tls::resolver_acceptor(manager.resolver(), &[ACME_TLS_ALPN_NAME]);
                let https = bind(&format!("0.0.0.0:{}", self.config.https_port)).await?;
                let http = bind(&format!("0.0.0.0:{}", self.config.http_port)).await?;
                let https_port = https.local_addr().map(|a| a.port()).unwrap_or(self.config.https_port);

                listeners.push(Listener {
                    listener: https,
                    tls: Some(acceptor),
                    context: base.clone(),
                });
                listeners.push(Listener {
                    listener: http,
                    tls: None,
                    context: ListenerContext {
                        redirect_port: Some(https_port),
                        challenges: Some(manager.http01_challenges()),
                        ..base
                    },
                });
                acme = Some(manager);
            }
        }

        let admin = if document.global.admin_off {
            None
        } else {
            Some(bind(&self.config.admin_addr).await?)
        };

        let mut addrs = BoundAddrs::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for (index, listener) in listeners.into_iter().enumerate() {
            let local = listener.listener.local_addr().ok();
            if index == 0 {
                addrs.site = local;
            } else {
                addrs.http = local;
            }
            info!(
                addr = ?local,
                protocol = if listener.tls.is_some() { "HTTPS" } else { "HTTP" },
                "Proxy listening (HTTP/1.1 and HTTP/2)"
            );
            tasks.push(tokio::spawn(accept_loop(listener, shutdown_rx.clone())));
        }

        if let Some(listener) = admin {
            addrs.admin = listener.local_addr().ok();
            let state = AdminState {
                document: document.clone(),
                stats: self.pool.stats(),
                loaded_at: chrono::Utc::now(),
            };
            tasks.push(tokio::spawn(
                AdminServer::new(listener, state, shutdown_rx.clone()).run(),
            ));
        }

        if let Some(manager) = acme {
            let mut stop_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    result = manager.run(shutdown_rx) => {
                        if let Err(e) = result {
                            error!(error = %e, "ACME certificate management failed");
                        }
                    }
                    _ = stop_rx.changed() => {}
                }
            }));
        }

        Ok(Instance {
            document: document.clone(),
            addrs,
            shutdown_tx,
            tasks,
        })
    }
}

impl ProxyEngine for EmbeddedEngine {
    async fn load(&self, document: &ProxyDocument) -> Result<(), EngineError> {
        let mut instance = self.instance.lock().await;

        let previous = match instance.take() {
            Some(old) => {
                let document = old.document.clone();
                old.shutdown().await.map_err(EngineError::halted)?;
                Some(document)
            }
            None => None,
        };

        let e = match self.spawn(document).await {
            Ok(new) => {
                *instance = Some(new);
                return Ok(());
            }
            Err(e) => e,
        };

        let Some(previous) = previous else {
            return Err(e);
        };

        warn!(error = %e, "New configuration failed; restoring previous one");
        match self.spawn(&previous).await {
            Ok(restored) => {
                *instance = Some(restored);
                Err(e)
            }
            Err(restore_err) => {
                error!(error = %restore_err, "Failed to restore previous configuration");
                Err(e.halted())
            }
        }
    }

    async fn stop(&self) -> Result<(), EngineError> {
        match self.instance.lock().await.take() {
            Some(instance) => instance.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Turn a site address into something `TcpListener::bind` accepts.
///
/// `:8080` and `8080` bind every interface.
pub fn listen_addr(address: &str) -> Result<String, EngineError> {
    let addr = address.trim();
    let addr = addr
        .strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr);
    let invalid = || EngineError::InvalidAddress(address.to_string());

    if let Some(port) = addr.strip_prefix(':') {
        port.parse::<u16>().map_err(|_| invalid())?;
        return Ok(format!("0.0.0.0:{}", port));
    }

    if addr.parse::<u16>().is_ok() {
        return Ok(format!("0.0.0.0:{}", addr));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr.to_string()),
        _ => Err(invalid()),
    }
}

async fn bind(addr: &str) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr).await.map_err(|source| EngineError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn accept_loop(listener: Listener, mut shutdown_rx: watch::Receiver<bool>) {
    let Listener {
        listener,
        tls,
        context,
    } = listener;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let context = context.clone();
                        let tls = tls.clone();
                        let shutdown_rx = shutdown_rx.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = serve_connection(tls_stream, addr, context, true, shutdown_rx).await {
                                            debug!(addr = %addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = serve_connection(stream, addr, context, false, shutdown_rx).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Proxy listener shutting down");
                break;
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    context: ListenerContext,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = context.clone();
        async move { handle_request(req, context, client_addr, is_tls).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: ListenerContext,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if let Some(challenges) = &context.challenges {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(key_auth) = challenges.get(token) {
                debug!(token, "Responding to ACME HTTP-01 challenge");
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(Full::new(Bytes::from(key_auth)).map_err(|never| match never {}).boxed())
                    .expect("valid response builder"));
            }
        }
    }

    if let Some(port) = context.redirect_port {
        return Ok(build_https_redirect(&req, port));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = request_host(&req);
    let upstream = match context.routing.resolve(host.as_deref()) {
        Ok(upstream) => upstream.to_string(),
        Err(code) => {
            debug!(host = ?host, request_id, "No site for request");
            let message = match code {
                ProxyErrorCode::BadRequest => "Missing Host header",
                _ => "Unknown or unconfigured host",
            };
            return Ok(json_error_response(code, message));
        }
    };

    let scheme = if is_tls { "https" } else { "http" };
    let headers = req.headers_mut();
    apply_forwarded_headers(
        headers,
        &context.routing.headers,
        scheme,
        host.as_deref(),
        client_addr.ip(),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    // HTTP/2 requests carry the host in :authority only
    if !headers.contains_key(hyper::header::HOST) {
        if let Some(value) = host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(hyper::header::HOST, value);
        }
    }

    debug!(host = ?host, upstream, method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, upstream, request_id, context.request_timeout).await;
    }

    let timeout = context.request_timeout;
    match tokio::time::timeout(timeout, context.pool.send_request(req, &upstream)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(upstream, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(upstream, request_id, timeout_secs = timeout.as_secs(), "Request timed out");
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// Host the client asked for: the Host header, or the URI authority for HTTP/2
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}

/// Overwrite the forwarded headers so clients cannot spoof them
fn apply_forwarded_headers(
    headers: &mut HeaderMap,
    forwarded: &[ForwardedHeader],
    scheme: &'static str,
    host: Option<&str>,
    client_ip: IpAddr,
) {
    for header in forwarded {
        let Ok(name) = HeaderName::from_bytes(header.header_name().as_bytes()) else {
            continue;
        };

        let value = match header {
            ForwardedHeader::Proto => Some(HeaderValue::from_static(scheme)),
            ForwardedHeader::Host => host.and_then(|h| HeaderValue::from_str(h).ok()),
            ForwardedHeader::RealIp => HeaderValue::from_str(&client_ip.to_string()).ok(),
        };

        match value {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }
}

/// 301 to the HTTPS listener
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let host = request_host(req);
    let host = match host.as_deref().map(strip_port) {
        Some(host) if host.contains(':') => format!("[{}]", host),
        Some(host) => host.to_string(),
        None => "localhost".to_string(),
    };
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request head sent to the upstream for an upgrade
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    head
}

/// Read up to the end of the response head. Bytes the upstream sent after the head
/// are returned separately.
async fn read_response_head<R>(stream: &mut R) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before completing the response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream response head too large",
            ));
        }
    }
}

fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    upstream: String,
    request_id: String,
    timeout: Duration,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(upstream, request_id, upgrade_type, "Handling upgrade request");

    let mut upstream_stream = match tokio::time::timeout(timeout, TcpStream::connect(&upstream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(upstream, error = %e, "Failed to connect to upstream for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Failed to connect to upstream",
            ));
        }
        Err(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                "Timed out connecting to upstream",
            ));
        }
    };

    if let Err(e) = upstream_stream.write_all(&build_upgrade_request(&req)).await {
        error!(upstream, error = %e, "Failed to send upgrade request");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, leftover) = match tokio::time::timeout(timeout, read_response_head(&mut upstream_stream)).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            error!(upstream, error = %e, "Failed to read upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from upstream",
            ));
        }
        Err(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                "Upstream did not answer the upgrade request",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(upstream, "Failed to parse upgrade response");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeFailed,
            "Invalid upgrade response from upstream",
        ));
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), value);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(upstream, status = %status, "Upstream rejected upgrade request");
        return Ok(response);
    }

    debug!(upstream, request_id, upgrade_type, "Upgrade accepted by upstream");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, upstream_stream, leftover, &upstream, &request_id).await;
            }
            Err(e) => {
                error!(upstream, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

async fn forward_bidirectional(
    client: Upgraded,
    mut upstream_stream: TcpStream,
    leftover: Vec<u8>,
    upstream: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(upstream, request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_stream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                upstream,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(upstream, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
