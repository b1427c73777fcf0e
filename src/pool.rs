//! Pooled HTTP client used to forward requests to upstreams

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid upstream URI '{0}'")]
    InvalidUpstream(String),
}

/// Counters exposed through the engine admin endpoint
#[derive(Debug, Default)]
pub struct PoolStats {
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
}

impl PoolStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `upstream` (`host:port`), keeping path, query and headers
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        upstream: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(upstream, &parts.uri)?;
        // Upstream connections are HTTP/1 even when the client spoke HTTP/2
        parts.version = hyper::Version::HTTP_11;

        let result = self.client.request(Request::from_parts(parts, body)).await;
        match result {
            Ok(response) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }
}

/// Rewrite `original` to target `upstream` over plain HTTP
pub fn upstream_uri(upstream: &str, original: &Uri) -> Result<Uri, PoolError> {
    let path = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{}{}", upstream, path)
        .parse()
        .map_err(|_| PoolError::InvalidUpstream(upstream.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let original: Uri = "/proxy/grafana/d/abc?orgId=1".parse().unwrap();
        let uri = upstream_uri("127.0.0.1:18080", &original).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:18080/proxy/grafana/d/abc?orgId=1");
    }

    #[test]
    fn test_upstream_uri_defaults_to_root() {
        let original: Uri = "http://dash.lan".parse().unwrap();
        let uri = upstream_uri("backend:9000", &original).unwrap();
        assert_eq!(uri.to_string(), "http://backend:9000/");
    }

    #[test]
    fn test_upstream_uri_rejects_garbage() {
        let original: Uri = "/".parse().unwrap();
        assert!(matches!(
            upstream_uri("bad host", &original),
            Err(PoolError::InvalidUpstream(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.stats().forwarded(), 0);
        assert_eq!(pool.stats().failed(), 0);
    }
}
