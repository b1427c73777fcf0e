use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the dashboard
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Title shown in the dashboard header
    #[serde(default = "default_title")]
    pub title: String,

    /// Listener and TLS settings used to generate the proxy document
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedded engine settings that never appear in the generated document
    #[serde(default)]
    pub engine: EngineConfig,

    /// Health poller settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Applications shown on the dashboard
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Listener, TLS and gateway options.
///
/// Exactly one TLS mode is derived from these fields when the proxy document is
/// generated: `domain` wins over `tls_cert`/`tls_key`, which win over plain HTTP.
/// Empty strings are treated the same as missing values.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ServerConfig {
    /// User-facing listen address (default: ":8080")
    pub listen_addr: Option<String>,

    /// Address the dashboard itself listens on. Derived from `listen_addr` when unset.
    pub internal_addr: Option<String>,

    /// Public domain; enables automatic HTTPS
    pub domain: Option<String>,

    /// ACME contact email for automatic HTTPS
    pub email: Option<String>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Path to an external proxy fragment imported into the generated document
    pub gateway: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn listen_addr(&self) -> &str {
        non_empty(&self.listen_addr).unwrap_or(DEFAULT_LISTEN_ADDR)
    }

    pub fn domain(&self) -> Option<&str> {
        non_empty(&self.domain)
    }

    pub fn email(&self) -> Option<&str> {
        non_empty(&self.email)
    }

    pub fn tls_cert(&self) -> Option<&str> {
        non_empty(&self.tls_cert)
    }

    pub fn tls_key(&self) -> Option<&str> {
        non_empty(&self.tls_key)
    }

    pub fn gateway(&self) -> Option<&str> {
        non_empty(&self.gateway)
    }

    /// The address the dashboard listens on: explicit `internal_addr`, or one derived
    /// from the listen address port.
    pub fn internal_addr(&self) -> String {
        match non_empty(&self.internal_addr) {
            Some(addr) => addr.to_string(),
            None => crate::document::derive_internal_addr(self.listen_addr()),
        }
    }
}

/// Settings for the embedded proxy engine
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Address of the engine admin endpoint (only served when the document keeps it enabled)
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// HTTPS port used in automatic HTTPS mode (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// HTTP port used for ACME HTTP-01 challenges and redirects in automatic HTTPS mode (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Local directory for certificate and account cache
    #[serde(default = "default_acme_cache_dir")]
    pub acme_cache_dir: String,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub acme_directory_url: Option<String>,

    /// Request timeout in seconds when forwarding to an upstream
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle upstream connections kept per host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_addr: default_admin_addr(),
            https_port: default_https_port(),
            http_port: default_http_port(),
            acme_cache_dir: default_acme_cache_dir(),
            acme_directory_url: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HealthConfig {
    /// Set to false to disable health polling entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between polling rounds in seconds
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Timeout for each probe in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures before an app is reported unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before an unhealthy app is reported healthy again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Accept self-signed and otherwise invalid certificates from probed apps
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            accept_invalid_certs: true,
        }
    }
}

/// A single application entry
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Display name; the URL slug is derived from it
    pub name: String,

    /// Where the application lives
    pub url: String,

    /// Disabled apps are hidden and never proxied
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub icon: Option<String>,

    pub description: Option<String>,
}

impl AppConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
            icon: None,
            description: None,
        }
    }

    /// Mark this app as disabled (builder pattern)
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self, index: usize) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("App #{}: 'name' must not be empty", index + 1));
        }
        if self.url.trim().is_empty() {
            return Err(format!("App '{}': 'url' must not be empty", self.name));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!(
                "App '{}': 'url' must start with http:// or https://",
                self.name
            ));
        }
        Ok(())
    }
}

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

// Default value functions
fn default_title() -> String {
    "Homepane".to_string()
}

fn default_true() -> bool {
    true
}

fn default_admin_addr() -> String {
    "127.0.0.1:2019".to_string()
}

fn default_https_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    80
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_success_threshold() -> u32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (index, app) in self.apps.iter().enumerate() {
            if let Err(e) = app.validate(index) {
                errors.push(e);
            }
        }

        if self.health.enabled && self.health.interval_secs == 0 {
            errors.push("health.interval_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: default_title(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
            apps: Vec::new(),
        }
    }
}
