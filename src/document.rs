//! Proxy configuration document generation
//!
//! Turns a [`ServerConfig`] into the document the embedded engine loads. Exactly one
//! TLS mode is selected:
//!
//! - `domain` set: automatic HTTPS with an ACME contact email
//! - `tls_cert` and `tls_key` set: manual TLS with the given files
//! - otherwise: plain HTTP
//!
//! A gateway fragment is imported in every mode. Generation never fails; unusable
//! input degrades to plain HTTP and unparseable ports fall back to the default base.

use crate::config::ServerConfig;
use std::fmt;

/// Port assumed when the listen address carries none (or an unusable one)
pub const DEFAULT_BASE_PORT: u16 = 8080;

/// Offset between the user-facing port and the internal dashboard port
pub const INTERNAL_PORT_OFFSET: u16 = 10000;

/// Derive the internal listen address from the user-facing one.
///
/// `":8080"` becomes `"127.0.0.1:18080"`. Missing, non-numeric or overflowing ports
/// use [`DEFAULT_BASE_PORT`].
pub fn derive_internal_addr(listen_addr: &str) -> String {
    let port = listen_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .and_then(|port| port.checked_add(INTERNAL_PORT_OFFSET))
        .unwrap_or(DEFAULT_BASE_PORT + INTERNAL_PORT_OFFSET);

    format!("127.0.0.1:{}", port)
}

/// TLS mode chosen for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Certificates obtained automatically for `domain`
    Automatic {
        domain: String,
        email: Option<String>,
    },
    /// Certificate and key supplied as files
    Manual { cert: String, key: String },
    /// No TLS
    Plain,
}

impl TlsMode {
    /// Pick the mode by priority: domain, then certificate files, then plain
    pub fn select(config: &ServerConfig) -> Self {
        if let Some(domain) = config.domain() {
            return TlsMode::Automatic {
                domain: domain.to_string(),
                email: config.email().map(String::from),
            };
        }

        match (config.tls_cert(), config.tls_key()) {
            (Some(cert), Some(key)) => TlsMode::Manual {
                cert: cert.to_string(),
                key: key.to_string(),
            },
            _ => TlsMode::Plain,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TlsMode::Automatic { .. } => "automatic",
            TlsMode::Manual { .. } => "manual",
            TlsMode::Plain => "plain",
        }
    }
}

/// Headers set on every upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedHeader {
    /// Scheme the client used
    Proto,
    /// Host header the client sent
    Host,
    /// Client address
    RealIp,
}

impl ForwardedHeader {
    pub const ALL: [ForwardedHeader; 3] = [
        ForwardedHeader::Proto,
        ForwardedHeader::Host,
        ForwardedHeader::RealIp,
    ];

    pub fn header_name(&self) -> &'static str {
        match self {
            ForwardedHeader::Proto => "X-Forwarded-Proto",
            ForwardedHeader::Host => "X-Forwarded-Host",
            ForwardedHeader::RealIp => "X-Real-IP",
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            ForwardedHeader::Proto => "{scheme}",
            ForwardedHeader::Host => "{host}",
            ForwardedHeader::RealIp => "{remote_host}",
        }
    }
}

/// Document-wide options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    /// ACME contact email
    pub email: Option<String>,
    /// Disable the engine admin endpoint
    pub admin_off: bool,
    /// Disable automatic certificate management
    pub auto_https_off: bool,
}

impl GlobalOptions {
    fn is_empty(&self) -> bool {
        self.email.is_none() && !self.admin_off && !self.auto_https_off
    }
}

/// Certificate and key references for manual TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

/// Forwarding block: one upstream, fixed headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseProxy {
    pub upstream: String,
    pub headers: Vec<ForwardedHeader>,
}

/// The single site served by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteBlock {
    /// Domain in automatic mode, listen address otherwise
    pub address: String,
    pub tls: Option<TlsFiles>,
    pub reverse_proxy: ReverseProxy,
}

/// Configuration document consumed by the embedded engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDocument {
    pub mode: TlsMode,
    pub global: GlobalOptions,
    pub site: SiteBlock,
    /// Path of an imported gateway fragment
    pub import: Option<String>,
}

impl ProxyDocument {
    pub fn upstream(&self) -> &str {
        &self.site.reverse_proxy.upstream
    }

    /// Render as Caddyfile-style text
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProxyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.global.is_empty() {
            writeln!(f, "{{")?;
            if let Some(email) = &self.global.email {
                writeln!(f, "\temail {}", email)?;
            }
            if self.global.admin_off {
                writeln!(f, "\tadmin off")?;
            }
            if self.global.auto_https_off {
                writeln!(f, "\tauto_https off")?;
            }
            writeln!(f, "}}")?;
            writeln!(f)?;
        }

        writeln!(f, "{} {{", self.site.address)?;
        if let Some(tls) = &self.site.tls {
            writeln!(f, "\ttls {} {}", tls.cert, tls.key)?;
        }
        writeln!(f, "\treverse_proxy {} {{", self.site.reverse_proxy.upstream)?;
        for header in &self.site.reverse_proxy.headers {
            writeln!(
                f,
                "\t\theader_up {} {}",
                header.header_name(),
                header.placeholder()
            )?;
        }
        writeln!(f, "\t}}")?;
        writeln!(f, "}}")?;

        if let Some(path) = &self.import {
            writeln!(f)?;
            writeln!(f, "import {}", path)?;
        }

        Ok(())
    }
}

/// Builds [`ProxyDocument`]s from server settings
pub struct ProxyConfigBuilder;

impl ProxyConfigBuilder {
    pub fn build(config: &ServerConfig) -> ProxyDocument {
        let reverse_proxy = ReverseProxy {
            upstream: config.internal_addr(),
            headers: ForwardedHeader::ALL.to_vec(),
        };

        let gateway = config.gateway().map(String::from);
        let mode = TlsMode::select(config);

        let (global, address, tls) = match &mode {
            TlsMode::Automatic { domain, email } => (
                GlobalOptions {
                    email: email.clone(),
                    admin_off: true,
                    auto_https_off: false,
                },
                domain.clone(),
                None,
            ),
            TlsMode::Manual { cert, key } => (
                GlobalOptions {
                    email: None,
                    admin_off: true,
                    auto_https_off: gateway.is_none(),
                },
                config.listen_addr().to_string(),
                Some(TlsFiles {
                    cert: cert.clone(),
                    key: key.clone(),
                }),
            ),
            TlsMode::Plain => (
                GlobalOptions {
                    email: None,
                    admin_off: false,
                    auto_https_off: gateway.is_none(),
                },
                config.listen_addr().to_string(),
                None,
            ),
        };

        ProxyDocument {
            mode,
            global,
            site: SiteBlock {
                address,
                tls,
                reverse_proxy,
            },
            import: gateway,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(f: impl FnOnce(&mut ServerConfig)) -> ServerConfig {
        let mut config = ServerConfig {
            listen_addr: Some(":8080".to_string()),
            ..Default::default()
        };
        f(&mut config);
        config
    }

    #[test]
    fn test_derive_internal_addr() {
        assert_eq!(derive_internal_addr(":8080"), "127.0.0.1:18080");
        assert_eq!(derive_internal_addr(":3000"), "127.0.0.1:13000");
        assert_eq!(derive_internal_addr("0.0.0.0:443"), "127.0.0.1:10443");
        assert_eq!(derive_internal_addr("[::]:9000"), "127.0.0.1:19000");
    }

    #[test]
    fn test_derive_internal_addr_falls_back() {
        assert_eq!(derive_internal_addr(":abc"), "127.0.0.1:18080");
        assert_eq!(derive_internal_addr(""), "127.0.0.1:18080");
        assert_eq!(derive_internal_addr("localhost"), "127.0.0.1:18080");
        assert_eq!(derive_internal_addr(":"), "127.0.0.1:18080");
        assert_eq!(derive_internal_addr(":60000"), "127.0.0.1:18080");
    }

    #[test]
    fn test_mode_priority() {
        let both = server(|c| {
            c.domain = Some("home.example.com".to_string());
            c.tls_cert = Some("/c.pem".to_string());
            c.tls_key = Some("/k.pem".to_string());
        });
        assert_eq!(TlsMode::select(&both).name(), "automatic");

        let files = server(|c| {
            c.tls_cert = Some("/c.pem".to_string());
            c.tls_key = Some("/k.pem".to_string());
        });
        assert_eq!(TlsMode::select(&files).name(), "manual");

        let cert_only = server(|c| c.tls_cert = Some("/c.pem".to_string()));
        assert_eq!(TlsMode::select(&cert_only), TlsMode::Plain);
    }

    #[test]
    fn test_domain_mode_document() {
        let config = server(|c| {
            c.domain = Some("home.example.com".to_string());
            c.email = Some("ops@example.com".to_string());
        });
        let doc = ProxyConfigBuilder::build(&config);
        let text = doc.render();

        assert!(text.contains("email ops@example.com"));
        assert!(text.contains("admin off"));
        assert!(!text.contains("auto_https off"));
        assert!(text.contains("home.example.com {"));
        assert!(!text.contains("import"));
    }

    #[test]
    fn test_domain_mode_without_email() {
        let config = server(|c| c.domain = Some("home.example.com".to_string()));
        let doc = ProxyConfigBuilder::build(&config);
        assert_eq!(doc.global.email, None);
        assert!(!doc.render().contains("email"));
    }

    #[test]
    fn test_manual_tls_document() {
        let config = server(|c| {
            c.tls_cert = Some("/etc/certs/cert.pem".to_string());
            c.tls_key = Some("/etc/certs/key.pem".to_string());
        });
        let text = ProxyConfigBuilder::build(&config).render();

        assert!(text.contains("auto_https off"));
        assert!(text.contains("admin off"));
        assert!(text.contains("tls /etc/certs/cert.pem /etc/certs/key.pem"));
        assert!(text.contains(":8080 {"));
    }

    #[test]
    fn test_manual_tls_with_gateway() {
        let config = server(|c| {
            c.tls_cert = Some("/c.pem".to_string());
            c.tls_key = Some("/k.pem".to_string());
            c.gateway = Some("/etc/homepane/gateway.toml".to_string());
        });
        let text = ProxyConfigBuilder::build(&config).render();

        assert!(!text.contains("auto_https off"));
        assert!(text.contains("import /etc/homepane/gateway.toml"));
        assert!(text.contains("tls /c.pem /k.pem"));
    }

    #[test]
    fn test_plain_document() {
        let doc = ProxyConfigBuilder::build(&server(|_| {}));
        let text = doc.render();

        assert_eq!(doc.mode, TlsMode::Plain);
        assert!(text.contains("auto_https off"));
        assert!(!text.contains("admin off"));
        assert!(!text.contains("tls "));
    }

    #[test]
    fn test_plain_with_gateway_has_no_global_block() {
        let config = server(|c| c.gateway = Some("gw.toml".to_string()));
        let text = ProxyConfigBuilder::build(&config).render();

        assert!(text.starts_with(":8080 {"));
        assert!(text.trim_end().ends_with("import gw.toml"));
    }

    #[test]
    fn test_forwarding_block() {
        let doc = ProxyConfigBuilder::build(&server(|c| c.listen_addr = Some(":3000".into())));
        let text = doc.render();

        assert_eq!(doc.upstream(), "127.0.0.1:13000");
        assert!(text.contains("reverse_proxy 127.0.0.1:13000 {"));
        assert!(text.contains("header_up X-Forwarded-Proto {scheme}"));
        assert!(text.contains("header_up X-Forwarded-Host {host}"));
        assert!(text.contains("header_up X-Real-IP {remote_host}"));
    }

    #[test]
    fn test_invalid_port_still_builds() {
        let doc = ProxyConfigBuilder::build(&server(|c| c.listen_addr = Some(":http".into())));
        assert_eq!(doc.upstream(), "127.0.0.1:18080");
        assert_eq!(doc.site.address, ":http");
    }
}
