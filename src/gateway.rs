//! Extra sites imported from a gateway fragment
//!
//! The fragment is a TOML file listing host → upstream pairs:
//!
//! ```toml
//! [[site]]
//! host = "plex.example.com"
//! upstream = "192.168.1.20:32400"
//! ```
//!
//! Requests whose Host header names one of these sites are forwarded to its upstream
//! instead of the dashboard.

use crate::engine::EngineError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySite {
    pub host: String,
    pub upstream: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayFile {
    #[serde(default, rename = "site")]
    sites: Vec<GatewaySite>,
}

/// Host → upstream table, hosts stored lower-case
#[derive(Debug, Clone, Default)]
pub struct GatewaySites {
    sites: HashMap<String, String>,
}

impl GatewaySites {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let fail = |reason: String| EngineError::Gateway {
            path: path.display().to_string(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        Self::parse(&content).map_err(fail)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let file: GatewayFile = toml::from_str(content).map_err(|e| e.to_string())?;

        let mut sites = HashMap::new();
        for (index, site) in file.sites.into_iter().enumerate() {
            let host = site.host.trim();
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host)
                .to_lowercase();
            if host.is_empty() {
                return Err(format!("site[{}]: 'host' must not be empty", index));
            }
            if !has_port(&site.upstream) {
                return Err(format!(
                    "site '{}': upstream '{}' must be host:port",
                    host, site.upstream
                ));
            }
            if sites.insert(host.clone(), site.upstream.trim().to_string()).is_some() {
                return Err(format!("site '{}' is defined more than once", host));
            }
        }

        Ok(Self { sites })
    }

    /// Upstream for `host` (port and case ignored)
    pub fn lookup(&self, host: &str) -> Option<&str> {
        self.sites.get(&strip_port(host).to_lowercase()).map(String::as_str)
    }

    /// All imported hosts, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.sites.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Host name of a Host header value. Brackets around IPv6 literals are removed, and a
/// trailing `:port` only when it parses as one.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() && !name.contains(':') => name,
        _ => host,
    }
}

fn has_port(addr: &str) -> bool {
    addr.trim()
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FRAGMENT: &str = r#"
[[site]]
host = "Plex.Example.com"
upstream = "192.168.1.20:32400"

[[site]]
host = "nas.example.com"
upstream = "nas.lan:5000"
"#;

    #[test]
    fn test_parse_and_lookup() {
        let sites = GatewaySites::parse(FRAGMENT).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites.lookup("plex.example.com"), Some("192.168.1.20:32400"));
        assert_eq!(sites.lookup("PLEX.example.com:443"), Some("192.168.1.20:32400"));
        assert_eq!(sites.lookup("other.example.com"), None);
        assert_eq!(sites.hosts(), vec!["nas.example.com", "plex.example.com"]);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("dash.lan:8080"), "dash.lan");
        assert_eq!(strip_port("dash.lan"), "dash.lan");
        assert_eq!(strip_port("dash.lan:"), "dash.lan:");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[fd00::2]"), "fd00::2");
        assert_eq!(strip_port("fd00::2"), "fd00::2");
    }

    #[test]
    fn test_lookup_ipv6_hosts() {
        let fragment = "[[site]]\nhost = \"[FD00::2]\"\nupstream = \"10.0.0.2:80\"\n\
                        [[site]]\nhost = \"::1\"\nupstream = \"10.0.0.3:80\"\n";
        let sites = GatewaySites::parse(fragment).unwrap();
        assert_eq!(sites.hosts(), vec!["::1", "fd00::2"]);

        assert_eq!(sites.lookup("[fd00::2]"), Some("10.0.0.2:80"));
        assert_eq!(sites.lookup("[fd00::2]:8443"), Some("10.0.0.2:80"));
        assert_eq!(sites.lookup("[::1]:8080"), Some("10.0.0.3:80"));
        assert_eq!(sites.lookup("[::2]:8080"), None);
    }

    #[test]
    fn test_empty_fragment() {
        let sites = GatewaySites::parse("").unwrap();
        assert!(sites.is_empty());
    }

    #[test]
    fn test_rejects_upstream_without_port() {
        let err = GatewaySites::parse("[[site]]\nhost = \"a.lan\"\nupstream = \"backend\"\n").unwrap_err();
        assert!(err.contains("host:port"));
    }

    #[test]
    fn test_rejects_duplicate_hosts() {
        let fragment = "[[site]]\nhost = \"a.lan\"\nupstream = \"x:1\"\n[[site]]\nhost = \"A.lan\"\nupstream = \"y:2\"\n";
        let err = GatewaySites::parse(fragment).unwrap_err();
        assert!(err.contains("more than once"));
    }

    #[test]
    fn test_load_reports_path() {
        let err = GatewaySites::load("/nonexistent/gateway.toml").unwrap_err();
        match err {
            EngineError::Gateway { path, .. } => assert_eq!(path, "/nonexistent/gateway.toml"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FRAGMENT.as_bytes()).unwrap();

        let sites = GatewaySites::load(file.path()).unwrap();
        assert_eq!(sites.lookup("nas.example.com"), Some("nas.lan:5000"));
    }
}
