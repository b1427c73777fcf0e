//! Seam between the lifecycle manager and the proxy engine it drives

use crate::document::ProxyDocument;
use std::future::Future;

/// Errors reported by a proxy engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("gateway import '{path}' failed: {reason}")]
    Gateway { path: String, reason: String },

    #[error("ACME setup failed: {0}")]
    Acme(String),

    #[error("engine did not shut down cleanly: {0}")]
    Shutdown(String),

    /// A failed load that also left the engine serving nothing
    #[error("{0}; nothing is being served")]
    Halted(#[source] Box<EngineError>),
}

impl EngineError {
    /// Wrap `self` to report that the engine is no longer serving
    pub fn halted(self) -> Self {
        match self {
            EngineError::Halted(_) => self,
            other => EngineError::Halted(Box::new(other)),
        }
    }

    /// True when the engine stopped serving as a result of this error
    pub fn is_halted(&self) -> bool {
        matches!(self, EngineError::Halted(_))
    }
}

/// An engine that serves a [`ProxyDocument`].
///
/// `load` replaces whatever the engine is currently serving. A failed `load` leaves the
/// previous document serving, or returns [`EngineError::Halted`] when it could not.
/// `stop` halts serving; stopping an engine that serves nothing must succeed.
pub trait ProxyEngine: Send + Sync + 'static {
    fn load(&self, document: &ProxyDocument) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), EngineError>> + Send;
}
