//! Integration tests for Homepane

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use homepane::config::{AppConfig, Config, EngineConfig, ServerConfig};
use homepane::dashboard::{DashboardServer, DashboardState};
use homepane::events::Event;
use homepane::healthcheck::SharedHealth;
use homepane::hub::{EventHub, HubConfig};
use homepane::lifecycle::ProxyManager;
use homepane::proxy::{BoundAddrs, EmbeddedEngine};
use homepane::routes::RouteRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

/// Upstream that answers every request with its name followed by the request head it received
async fn echo_upstream(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let body = format!("{}\n{}", name, String::from_utf8_lossy(&head));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// An address nothing listens on
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn server_config(upstream: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen_addr: Some("127.0.0.1:0".to_string()),
        internal_addr: Some(upstream.to_string()),
        ..Default::default()
    }
}

fn engine() -> EmbeddedEngine {
    EmbeddedEngine::new(EngineConfig {
        admin_addr: "127.0.0.1:0".to_string(),
        request_timeout_secs: 5,
        ..Default::default()
    })
}

async fn site_port(manager: &ProxyManager<EmbeddedEngine>) -> u16 {
    manager
        .engine()
        .bound_addrs()
        .await
        .site
        .expect("site listener bound")
        .port()
}

/// Send a raw HTTP/1.1 GET and read the whole response
async fn http_get_with_host(port: u16, path: &str, host: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await??;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_get_with_host(port, path, &format!("127.0.0.1:{}", port)).await
}

/// Dashboard on an ephemeral port with its hub running
async fn start_dashboard(config: &Config) -> (SocketAddr, Arc<DashboardState>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hub, hub_loop) = EventHub::new(HubConfig::default());
    tokio::spawn(hub_loop.run(shutdown_rx.clone()));

    let state = Arc::new(DashboardState::new(
        Arc::new(RouteRegistry::new()),
        hub,
        SharedHealth::default(),
    ));
    state.apply(config);

    let server = DashboardServer::bind("127.0.0.1:0", Arc::clone(&state)).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(shutdown_rx));

    (addr, state, shutdown_tx)
}

async fn wait_for_clients(hub: &EventHub, count: usize) {
    for _ in 0..100 {
        if hub.client_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} clients, have {}", count, hub.client_count());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_parsing() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
title = "Home Lab"

[server]
listen_addr = ":9000"
gateway = "/etc/homepane/gateway.toml"

[health]
interval_secs = 15
failure_threshold = 3

[[apps]]
name = "Home Assistant"
url = "http://192.168.1.10:8123"
description = "Automations"

[[apps]]
name = "Old NAS"
url = "http://192.168.1.2"
enabled = false
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.title, "Home Lab");
    assert_eq!(config.server.listen_addr(), ":9000");
    assert_eq!(config.server.internal_addr(), "127.0.0.1:19000");
    assert_eq!(config.server.gateway(), Some("/etc/homepane/gateway.toml"));
    assert_eq!(config.health.interval_secs, 15);
    assert_eq!(config.health.failure_threshold, 3);
    assert_eq!(config.apps.len(), 2);
    assert!(!config.apps[1].enabled);
    assert_eq!(config.engine, EngineConfig::default());
}

#[test]
fn test_config_rejects_empty_app_url() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[[apps]]\nname = \"Broken\"\nurl = \"\"\n").unwrap();

    let err = Config::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("url"));
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
async fn test_plain_engine_forwards_with_headers() {
    let upstream = echo_upstream("dashboard").await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(upstream)).await.unwrap();
    let port = site_port(&manager).await;

    let response = http_get_with_host(port, "/api/apps?x=1", "dash.lan").await.unwrap();
    let lower = response.to_lowercase();

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.contains("dashboard\nGET /api/apps?x=1 HTTP/1.1"));
    assert!(lower.contains("x-forwarded-proto: http\r\n"));
    assert!(lower.contains("x-forwarded-host: dash.lan\r\n"));
    assert!(lower.contains("x-real-ip: 127.0.0.1\r\n"));
    assert!(lower.contains("x-request-id: "));
    assert_eq!(manager.engine().stats().forwarded(), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_cannot_spoof_forwarded_headers() {
    let upstream = echo_upstream("dashboard").await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(upstream)).await.unwrap();
    let port = site_port(&manager).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: dash.lan\r\nX-Real-IP: 6.6.6.6\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let lower = response.to_lowercase();

    assert!(!lower.contains("6.6.6.6"));
    assert!(lower.contains("x-real-ip: 127.0.0.1\r\n"));
    assert!(lower.contains("x-forwarded-proto: http\r\n"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_upstream_down_returns_bad_gateway() {
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(closed_addr().await)).await.unwrap();
    let port = site_port(&manager).await;

    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: upstream_unavailable"));
    assert!(response.contains(r#""code":"UPSTREAM_UNAVAILABLE""#));
    assert_eq!(manager.engine().stats().failed(), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_admin_endpoint_serves_rendered_document() {
    let upstream = echo_upstream("dashboard").await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(upstream)).await.unwrap();

    let admin = manager.engine().bound_addrs().await.admin.expect("admin endpoint in plain mode");
    let response = http_get(admin.port(), "/config").await.unwrap();

    let document = manager.current_document().await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(&document.render()));
    assert!(response.contains(&format!("reverse_proxy {} {{", upstream)));
    assert!(response.contains("header_up X-Real-IP {remote_host}"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_listeners() {
    let upstream = echo_upstream("dashboard").await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(upstream)).await.unwrap();
    assert!(manager.is_running().await);

    let addrs = manager.engine().bound_addrs().await;
    let site = addrs.site.unwrap();
    let admin = addrs.admin.unwrap();

    manager.stop().await.unwrap();
    assert!(!manager.is_running().await);
    assert_eq!(manager.engine().bound_addrs().await, BoundAddrs::default());

    assert!(TcpStream::connect(site).await.is_err());
    assert!(TcpStream::connect(admin).await.is_err());

    // Stopping again is a no-op
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_while_running_reloads() {
    let first = echo_upstream("first").await;
    let second = echo_upstream("second").await;
    let manager = ProxyManager::new(engine());

    manager.start(&server_config(first)).await.unwrap();
    let old_port = site_port(&manager).await;

    manager.start(&server_config(second)).await.unwrap();
    let new_port = site_port(&manager).await;

    let response = http_get(new_port, "/").await.unwrap();
    assert!(response.contains("second\n"));
    assert!(TcpStream::connect(format!("127.0.0.1:{}", old_port)).await.is_err());
    assert_eq!(manager.current_document().await.unwrap().upstream(), second.to_string());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_document() {
    let upstream = echo_upstream("dashboard").await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(upstream)).await.unwrap();
    let before = manager.current_document().await;

    let broken = ServerConfig {
        gateway: Some("/nonexistent/homepane/gateway.toml".to_string()),
        ..server_config(upstream)
    };
    let err = manager.start(&broken).await.unwrap_err();
    assert!(err.to_string().contains("gateway"));

    assert!(manager.is_running().await);
    assert_eq!(manager.current_document().await, before);
    assert_eq!(manager.engine().document().await, before);

    // The restored instance still serves
    let response = http_get(site_port(&manager).await, "/").await.unwrap();
    assert!(response.contains("dashboard\n"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_reload_without_restore_stops_manager() {
    let dashboard = echo_upstream("dashboard").await;
    let plex = echo_upstream("plex").await;

    let mut gateway = tempfile::NamedTempFile::new().unwrap();
    write!(gateway, "[[site]]\nhost = \"plex.lan\"\nupstream = \"{}\"\n", plex).unwrap();

    let manager = ProxyManager::new(engine());
    let initial = ServerConfig {
        gateway: Some(gateway.path().display().to_string()),
        ..server_config(dashboard)
    };
    manager.start(&initial).await.unwrap();

    // The previous document can no longer be spawned either
    gateway.close().unwrap();

    let manual = ServerConfig {
        tls_cert: Some("/nonexistent/homepane/cert.pem".to_string()),
        tls_key: Some("/nonexistent/homepane/key.pem".to_string()),
        ..server_config(dashboard)
    };
    let err = manager.start(&manual).await.unwrap_err();
    assert!(err.to_string().contains("nothing is being served"));

    assert!(!manager.is_running().await);
    assert!(manager.current_document().await.is_none());
    assert_eq!(manager.engine().bound_addrs().await, BoundAddrs::default());
    assert!(manager.engine().document().await.is_none());

    // A good configuration brings it back
    manager.start(&server_config(dashboard)).await.unwrap();
    assert!(manager.is_running().await);
    let response = http_get(site_port(&manager).await, "/").await.unwrap();
    assert!(response.contains("dashboard\n"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_gateway_sites_route_by_host() {
    let dashboard = echo_upstream("dashboard").await;
    let plex = echo_upstream("plex").await;

    let mut gateway = tempfile::NamedTempFile::new().unwrap();
    write!(gateway, "[[site]]\nhost = \"plex.lan\"\nupstream = \"{}\"\n", plex).unwrap();

    let config = ServerConfig {
        gateway: Some(gateway.path().display().to_string()),
        ..server_config(dashboard)
    };
    let manager = ProxyManager::new(engine());
    manager.start(&config).await.unwrap();
    let port = site_port(&manager).await;

    let response = http_get_with_host(port, "/web", "PLEX.lan").await.unwrap();
    assert!(response.contains("plex\nGET /web HTTP/1.1"));

    let response = http_get_with_host(port, "/", "dash.lan").await.unwrap();
    assert!(response.contains("dashboard\n"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_manual_tls_listener() {
    let upstream = echo_upstream("dashboard").await;

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let config = ServerConfig {
        tls_cert: Some(cert_path.display().to_string()),
        tls_key: Some(key_path.display().to_string()),
        ..server_config(upstream)
    };
    let manager = ProxyManager::new(engine());
    manager.start(&config).await.unwrap();

    // Manual mode turns the admin endpoint off
    let addrs = manager.engine().bound_addrs().await;
    assert!(addrs.admin.is_none());

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let body = client
        .get(format!("https://localhost:{}/api/apps", addrs.site.unwrap().port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
        .to_lowercase();

    assert!(body.starts_with("dashboard\n"));
    assert!(body.contains("x-forwarded-proto: https\r\n"));

    manager.stop().await.unwrap();
}

// ============================================================================
// Dashboard through the engine
// ============================================================================

fn dashboard_config() -> Config {
    let mut config = Config::default();
    config.title = "Home Lab".to_string();
    config.apps = vec![
        AppConfig::new("Grafana", "http://192.168.1.5:3000"),
        AppConfig::new("Home Assistant", "http://192.168.1.10:8123"),
    ];
    config
}

#[tokio::test]
async fn test_dashboard_api_through_engine() {
    let config = dashboard_config();
    let (dashboard, _state, _shutdown) = start_dashboard(&config).await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(dashboard)).await.unwrap();
    let port = site_port(&manager).await;

    let response = http_get(port, "/api/apps").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let value: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(value["title"], "Home Lab");
    assert_eq!(value["apps"][1]["slug"], "home-assistant");
    assert_eq!(value["apps"][1]["proxy_url"], "/proxy/home-assistant/");

    let response = http_get(port, "/missing").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_receives_broadcasts_through_engine() {
    let config = dashboard_config();
    let (dashboard, state, _shutdown) = start_dashboard(&config).await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(dashboard)).await.unwrap();
    let port = site_port(&manager).await;

    let stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let (mut socket, response) = tokio_tungstenite::client_async(format!("ws://127.0.0.1:{}/ws", port), stream)
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    wait_for_clients(state.hub(), 1).await;

    let mut next = config.clone();
    next.title = "Renamed".to_string();
    let snapshot = state.apply(&next);
    state.hub().broadcast_config_update(snapshot.clone()).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match message {
        Message::Text(text) => text,
        other => panic!("expected a text frame, got {:?}", other),
    };

    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["type"], "config_updated");
    assert_eq!(value["payload"]["title"], "Renamed");

    let event: Event = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(event, Event::ConfigUpdated(snapshot));

    // Closing the socket unregisters the client
    socket.close(None).await.unwrap();
    wait_for_clients(state.hub(), 0).await;

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_cross_origin_websocket_rejected() {
    let config = dashboard_config();
    let (dashboard, state, _shutdown) = start_dashboard(&config).await;
    let manager = ProxyManager::new(engine());
    manager.start(&server_config(dashboard)).await.unwrap();
    let port = site_port(&manager).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Origin: http://evil.example.com\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).to_lowercase();

    assert!(response.starts_with("http/1.1 403"), "unexpected response: {}", response);
    assert!(response.contains("x-proxy-error: forbidden_origin"));
    assert_eq!(state.hub().client_count(), 0);

    manager.stop().await.unwrap();
}
