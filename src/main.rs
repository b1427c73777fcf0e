use homepane::admin::{PKG_NAME, VERSION};
use homepane::config::Config;
use homepane::dashboard::{DashboardServer, DashboardState};
use homepane::document::TlsMode;
use homepane::healthcheck::{HealthChecker, SharedHealth};
use homepane::hub::{EventHub, HubConfig};
use homepane::lifecycle::ProxyManager;
use homepane::proxy::EmbeddedEngine;
use homepane::routes::RouteRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("homepane=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Event hub
    let (hub, hub_loop) = EventHub::new(HubConfig::default());
    let hub_handle = tokio::spawn(hub_loop.run(shutdown_rx.clone()));

    // Routes and dashboard state
    let routes = Arc::new(RouteRegistry::new());
    let health = SharedHealth::default();
    let state = Arc::new(DashboardState::new(Arc::clone(&routes), hub.clone(), Arc::clone(&health)));
    state.apply(&config);

    // Dashboard on the internal address; the engine forwards everything here
    let internal_addr = config.server.internal_addr();
    let dashboard = DashboardServer::bind(&internal_addr, Arc::clone(&state))
        .await
        .map_err(|e| {
            error!(addr = %internal_addr, error = %e, "Failed to start dashboard");
            e
        })?;
    let dashboard_handle = tokio::spawn(dashboard.run(shutdown_rx.clone()));

    // Health checker
    let health_handle = if config.health.enabled {
        let checker = HealthChecker::new(Arc::clone(&routes), hub.clone(), health, config.health.clone())?;
        Some(tokio::spawn(checker.run(shutdown_rx.clone())))
    } else {
        info!("Health checks disabled");
        None
    };

    // Proxy engine
    let manager = ProxyManager::new(EmbeddedEngine::new(config.engine.clone()));
    if let Err(e) = manager.start(&config.server).await {
        error!(error = %e, "Failed to start proxy");
        let _ = shutdown_tx.send(true);
        return Err(e.into());
    }

    #[cfg(unix)]
    let mut current = config;

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match Config::load(&config_path) {
                        Ok(next) => {
                            reload(&state, &current, &next).await;
                            current = next;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop the proxy first so no new requests reach the dashboard
    info!("Stopping proxy...");
    if let Err(e) = manager.stop().await {
        error!(error = %e, "Failed to stop proxy");
    }

    let _ = shutdown_tx.send(true);

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = dashboard_handle.await;
        if let Some(handle) = health_handle {
            let _ = handle.await;
        }
        let _ = hub_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Apply a reloaded configuration to the dashboard. Server settings need a restart.
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(state: &DashboardState, current: &Config, next: &Config) {
    let snapshot = state.apply(next);
    info!(apps = snapshot.apps.len(), title = %snapshot.title, "Configuration reloaded successfully");

    if let Err(e) = state.hub().broadcast_config_update(snapshot).await {
        warn!(error = %e, "Failed to broadcast configuration update");
    }

    if next.server != current.server || next.engine != current.engine {
        warn!("Server settings changed; restart to apply them");
    }
    if next.health != current.health {
        warn!("Health check settings changed; restart to apply them");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, title = %config.title, "Starting dashboard");

    let mode = TlsMode::select(&config.server);
    info!(
        listen_addr = %config.server.listen_addr(),
        internal_addr = %config.server.internal_addr(),
        tls = mode.name(),
        domain = ?config.server.domain(),
        gateway = ?config.server.gateway(),
        "Server configuration"
    );
    info!(
        admin_addr = %config.engine.admin_addr,
        request_timeout_secs = config.engine.request_timeout_secs,
        pool_max_idle = config.engine.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.engine.pool_idle_timeout_secs,
        "Engine settings"
    );
    info!(
        enabled = config.health.enabled,
        interval_secs = config.health.interval_secs,
        timeout_secs = config.health.timeout_secs,
        failure_threshold = config.health.failure_threshold,
        "Health check settings"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.iter().map(|app| app.name.as_str()).collect::<Vec<_>>(),
        "Configured apps"
    );
}
