//! Start/stop control over the proxy engine
//!
//! [`ProxyManager`] is the only owner of the engine's running state and of the document
//! it was last loaded with. `start` and `stop` take the same lock, so a reconfiguration
//! can never interleave with a shutdown.
//!
//! There is no automatic reload: new TLS settings take effect on the next explicit
//! `start`.

use crate::config::ServerConfig;
use crate::document::{ProxyConfigBuilder, ProxyDocument};
use crate::engine::{EngineError, ProxyEngine};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to load proxy configuration: {0}")]
    Load(#[source] EngineError),

    #[error("failed to stop proxy: {0}")]
    Stop(#[source] EngineError),
}

#[derive(Debug, Default)]
struct ManagerState {
    running: bool,
    document: Option<ProxyDocument>,
}

/// Owns the running/stopped state of a [`ProxyEngine`]
pub struct ProxyManager<E> {
    engine: E,
    state: Mutex<ManagerState>,
}

impl<E: ProxyEngine> ProxyManager<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Generate a document from `config` and load it into the engine.
    ///
    /// On failure the previous state is kept, unless the engine reports that it is no
    /// longer serving; then the manager is marked stopped. Starting while running
    /// reloads the engine with the new document.
    pub async fn start(&self, config: &ServerConfig) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        let document = ProxyConfigBuilder::build(config);

        info!(
            mode = document.mode.name(),
            site = %document.site.address,
            upstream = %document.upstream(),
            gateway = ?document.import,
            reload = state.running,
            "Loading proxy configuration"
        );

        if let Err(e) = self.engine.load(&document).await {
            if e.is_halted() {
                warn!(error = %e, "Proxy is no longer serving after failed load");
                state.running = false;
                state.document = None;
            }
            return Err(LifecycleError::Load(e));
        }

        state.running = true;
        state.document = Some(document);
        info!("Proxy started");
        Ok(())
    }

    /// Stop the engine. A no-op when already stopped.
    ///
    /// If the engine reports a failure the manager still believes it is running; the
    /// engine's real state is unknown at that point.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }

        if let Err(e) = self.engine.stop().await {
            warn!(error = %e, "Proxy stop failed; engine state may be inconsistent");
            return Err(LifecycleError::Stop(e));
        }

        state.running = false;
        info!("Proxy stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// The document most recently loaded successfully
    pub async fn current_document(&self) -> Option<ProxyDocument> {
        self.state.lock().await.document.clone()
    }
}
