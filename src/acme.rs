//! Automatic HTTPS via ACME
//!
//! Certificates for the dashboard domain (plus any gateway hosts) are requested from an
//! ACME directory, Let's Encrypt production by default. The engine answers both challenge
//! types, so the manager takes TLS-ALPN-01 when the server offers it and falls back to
//! HTTP-01.
//!
//! Account credentials and the issued certificate are cached on disk. The private key
//! file is written with mode 0600 on Unix but is not encrypted.

use crate::config::EngineConfig;
use crate::document::{ProxyDocument, TlsMode};
use crate::engine::EngineError;
use crate::gateway::GatewaySites;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// Renew when fewer days than this remain
const RENEW_BEFORE_DAYS: u64 = 30;
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const ISSUE_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Where and for whom certificates are requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    /// First entry is the certificate's common name
    pub domains: Vec<String>,
    pub email: Option<String>,
    pub cache_dir: String,
    pub directory_url: Option<String>,
}

impl AcmeSettings {
    /// Settings for an automatic-mode document; `None` in the other modes
    pub fn for_document(
        document: &ProxyDocument,
        engine: &EngineConfig,
        gateway: &GatewaySites,
    ) -> Option<Self> {
        let TlsMode::Automatic { domain, email } = &document.mode else {
            return None;
        };

        let mut domains = vec![domain.to_lowercase()];
        for host in gateway.hosts() {
            if !domains.contains(&host) {
                domains.push(host);
            }
        }

        Some(Self {
            domains,
            email: email.clone(),
            cache_dir: engine.acme_cache_dir.clone(),
            directory_url: engine.acme_directory_url.clone(),
        })
    }
}

/// Pending HTTP-01 tokens and their key authorizations
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

/// Serves the issued certificate, or a TLS-ALPN-01 challenge certificate when the
/// client negotiates `acme-tls/1`
#[derive(Default)]
pub struct CertResolver {
    challenge_certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("challenges", &self.challenge_certs.read().len())
            .field("has_certificate", &self.current.read().is_some())
            .finish()
    }
}

impl CertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_challenge_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.challenge_certs.write().insert(domain.to_string(), cert);
    }

    pub fn remove_challenge_cert(&self, domain: &str) {
        self.challenge_certs.write().remove(domain);
    }

    pub fn set_certificate(&self, cert: Arc<CertifiedKey>) {
        *self.current.write() = Some(cert);
    }

    pub fn has_certificate(&self) -> bool {
        self.current.read().is_some()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        if is_acme_challenge {
            return client_hello
                .server_name()
                .and_then(|sni| self.challenge_certs.read().get(sni).cloned());
        }

        self.current.read().clone()
    }
}

type CertPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Obtains and renews the certificate for one [`AcmeSettings`]
pub struct AcmeManager {
    settings: AcmeSettings,
    cache_dir: PathBuf,
    http01: Http01Challenges,
    resolver: Arc<CertResolver>,
    current: RwLock<Option<Vec<CertificateDer<'static>>>>,
}

impl AcmeManager {
    pub fn new(settings: AcmeSettings) -> Result<Self, EngineError> {
        if settings.domains.is_empty() {
            return Err(EngineError::Acme("no domains to certify".to_string()));
        }
        let cache_dir = validate_cache_dir(&settings.cache_dir)?;

        Ok(Self {
            settings,
            cache_dir,
            http01: Http01Challenges::new(),
            resolver: Arc::new(CertResolver::new()),
            current: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> &AcmeSettings {
        &self.settings
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01.clone()
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::clone(&self.resolver)
    }

    /// Install a cached certificate if one covers every domain and is not due for renewal
    pub fn load_cached(&self) -> bool {
        match self.read_cached_cert() {
            Some((certs, key)) => match self.install(certs, key) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Cached certificate unusable");
                    false
                }
            },
            None => false,
        }
    }

    /// Obtain a certificate if none is installed, then renew it until shutdown.
    ///
    /// Failures are logged and retried: every [`ISSUE_RETRY_INTERVAL`] while no
    /// certificate is installed, at the next renewal check otherwise.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut account = None;

        while !*shutdown_rx.borrow() {
            let needs_certificate = self
                .current
                .read()
                .as_ref()
                .and_then(|certs| certs.first().map(|c| !is_cert_valid_for_days(c, RENEW_BEFORE_DAYS)))
                .unwrap_or(true);

            if needs_certificate {
                info!(domains = ?self.settings.domains, "Certificate issuance needed");
                tokio::select! {
                    result = self.issue(&mut account) => {
                        if let Err(e) = result {
                            error!(error = %e, "Failed to obtain certificate");
                        }
                    }
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                }
            }

            let wait = if self.current.read().is_some() {
                RENEWAL_CHECK_INTERVAL
            } else {
                ISSUE_RETRY_INTERVAL
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }

        debug!("ACME manager shutting down");
        Ok(())
    }

    /// Renew with the cached account, creating or loading one first if needed
    async fn issue(&self, account: &mut Option<Account>) -> anyhow::Result<()> {
        let current = match account.take() {
            Some(current) => current,
            None => self.get_or_create_account().await?,
        };
        let result = self.renew(&current).await;
        *account = Some(current);
        result
    }

    async fn renew(&self, account: &Account) -> anyhow::Result<()> {
        let (certs, key, cert_pem, key_pem) = self.obtain_certificate(account).await?;
        self.save_cert(&cert_pem, &key_pem)?;
        self.install(certs, key)?;
        info!(domains = ?self.settings.domains, "Certificate installed");
        Ok(())
    }

    fn install(&self, certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<()> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

        self.resolver
            .set_certificate(Arc::new(CertifiedKey::new(certs.clone(), signing_key)));
        *self.current.write() = Some(certs);
        Ok(())
    }

    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!("Creating new ACME account");
        let contact: Vec<String> = self
            .settings
            .email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        let directory_url = self
            .settings
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    fn cert_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.cache_dir.join(&self.settings.domains[0]);
        (dir.join("cert.pem"), dir.join("key.pem"))
    }

    fn read_cached_cert(&self) -> Option<CertPair> {
        let (cert_path, key_path) = self.cert_paths();

        let cert_data = std::fs::read(&cert_path).ok()?;
        let key_data = std::fs::read(&key_path).ok()?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
            .filter_map(|c| c.ok())
            .collect();
        let leaf = certs.first()?;

        if !cert_covers(leaf, &self.settings.domains) {
            info!(domains = ?self.settings.domains, "Cached certificate does not cover all domains");
            return None;
        }
        if !is_cert_valid_for_days(leaf, RENEW_BEFORE_DAYS) {
            return None;
        }

        let key = load_private_key(&key_data)?;
        info!(path = %cert_path.display(), "Loaded cached certificate");
        Some((certs, key))
    }

    fn save_cert(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let (cert_path, key_path) = self.cert_paths();
        if let Some(dir) = cert_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        std::fs::write(&cert_path, cert_chain_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, private_key_pem)?;
        }

        info!(path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }

    async fn obtain_certificate(
        &self,
        account: &Account,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, String, String)> {
        let identifiers: Vec<Identifier> = self
            .settings
            .domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        info!(domains = ?self.settings.domains, "Requesting new certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let Identifier::Dns(identifier) = &authz.identifier;
            let identifier = identifier.clone();

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .or_else(|| authz.challenges.iter().find(|c| c.r#type == ChallengeType::Http01))
                .ok_or_else(|| anyhow::anyhow!("No supported challenge offered for {}", identifier))?;

            let key_auth = order.key_authorization(challenge);
            let use_alpn = challenge.r#type == ChallengeType::TlsAlpn01;

            if use_alpn {
                debug!(domain = %identifier, "Setting up TLS-ALPN-01 challenge");
                let digest: Vec<u8> = key_auth.digest().as_ref().to_vec();
                self.resolver
                    .set_challenge_cert(&identifier, create_tls_alpn01_cert(&identifier, &digest)?);
            } else {
                debug!(domain = %identifier, token = %challenge.token, "Setting up HTTP-01 challenge");
                self.http01
                    .set(challenge.token.clone(), key_auth.as_str().to_string());
            }

            order.set_challenge_ready(&challenge.url).await?;
            let outcome = self.wait_for_authorization(&mut order, &identifier).await;

            if use_alpn {
                self.resolver.remove_challenge_cert(&identifier);
            } else {
                self.http01.remove(&challenge.token);
            }
            outcome?;
        }

        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(self.settings.domains.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.settings.domains[0].clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();

        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        Ok((certs, key, cert_chain_pem, private_key.serialize_pem()))
    }

    async fn wait_for_authorization(
        &self,
        order: &mut instant_acme::Order,
        identifier: &str,
    ) -> anyhow::Result<()> {
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let authorizations = order.authorizations().await?;
            let status = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier))
                .map(|a| &a.status);

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    debug!(domain = %identifier, attempt, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => anyhow::bail!("Authorization failed for {}", identifier),
                Some(status) => anyhow::bail!("Authorization for {} ended as {:?}", identifier, status),
                None => anyhow::bail!("Authorization not found for {}", identifier),
            }
        }

        anyhow::bail!("Authorization timeout for {}", identifier)
    }
}

/// Self-signed certificate carrying the acmeIdentifier extension
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // OCTET STRING of 32 bytes
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);

    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Whether every domain appears among the certificate's DNS names
fn cert_covers(cert: &CertificateDer<'_>, domains: &[String]) -> bool {
    use x509_parser::prelude::*;

    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        return false;
    };

    let names: Vec<String> = match parsed.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    domains.iter().all(|d| names.contains(&d.to_lowercase()))
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let expiry = parsed.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(remaining_days, required_days = days, "Certificate expires soon");
        return false;
    }

    true
}

fn validate_cache_dir(path: &str) -> Result<PathBuf, EngineError> {
    if path.contains("..") {
        return Err(EngineError::Acme(
            "cache directory path must not contain '..'".to_string(),
        ));
    }

    let path_buf = PathBuf::from(path);
    if path_buf.exists() {
        let canonical = path_buf
            .canonicalize()
            .map_err(|e| EngineError::Acme(format!("cannot resolve cache directory '{}': {}", path, e)))?;
        if !canonical.is_dir() {
            return Err(EngineError::Acme(format!(
                "cache path '{}' exists but is not a directory",
                path
            )));
        }
        return Ok(canonical);
    }

    Ok(path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::document::ProxyConfigBuilder;
    use rcgen::{generate_simple_self_signed, CertifiedKey as RcgenCert};

    fn self_signed(names: &[&str]) -> RcgenCert {
        generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<String>>()).unwrap()
    }

    fn settings(cache_dir: &str) -> AcmeSettings {
        AcmeSettings {
            domains: vec!["home.example.com".to_string(), "plex.example.com".to_string()],
            email: Some("admin@example.com".to_string()),
            cache_dir: cache_dir.to_string(),
            directory_url: None,
        }
    }

    #[test]
    fn test_http01_challenges() {
        let challenges = Http01Challenges::new();
        challenges.set("token123".to_string(), "key_auth_123".to_string());

        assert_eq!(challenges.get("token123"), Some("key_auth_123".to_string()));
        assert_eq!(challenges.get("nonexistent"), None);

        challenges.remove("token123");
        assert_eq!(challenges.get("token123"), None);
    }

    #[test]
    fn test_settings_only_in_automatic_mode() {
        let engine = EngineConfig::default();
        let gateway = GatewaySites::parse(
            "[[site]]\nhost = \"plex.example.com\"\nupstream = \"10.0.0.2:32400\"\n",
        )
        .unwrap();

        let plain = ProxyConfigBuilder::build(&ServerConfig::default());
        assert!(AcmeSettings::for_document(&plain, &engine, &gateway).is_none());

        let automatic = ProxyConfigBuilder::build(&ServerConfig {
            domain: Some("Home.Example.com".to_string()),
            email: Some("admin@example.com".to_string()),
            ..Default::default()
        });
        let settings = AcmeSettings::for_document(&automatic, &engine, &gateway).unwrap();
        assert_eq!(settings.domains, vec!["home.example.com", "plex.example.com"]);
        assert_eq!(settings.email.as_deref(), Some("admin@example.com"));
        assert_eq!(settings.cache_dir, "./acme_cache");
    }

    #[test]
    fn test_cert_covers_domains() {
        let cert = self_signed(&["home.example.com", "plex.example.com"]);
        let der = CertificateDer::from(cert.cert.der().to_vec());

        assert!(cert_covers(&der, &["home.example.com".to_string()]));
        assert!(cert_covers(
            &der,
            &["PLEX.example.com".to_string(), "home.example.com".to_string()]
        ));
        assert!(!cert_covers(&der, &["nas.example.com".to_string()]));
    }

    #[test]
    fn test_fresh_self_signed_cert_is_valid() {
        let cert = self_signed(&["home.example.com"]);
        let der = CertificateDer::from(cert.cert.der().to_vec());
        assert!(is_cert_valid_for_days(&der, RENEW_BEFORE_DAYS));
    }

    #[test]
    fn test_load_cached_installs_matching_cert() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(settings(dir.path().to_str().unwrap())).unwrap();
        assert!(!manager.load_cached());

        let cert = self_signed(&["home.example.com", "plex.example.com"]);
        manager
            .save_cert(&cert.cert.pem(), &cert.key_pair.serialize_pem())
            .unwrap();

        assert!(manager.load_cached());
        assert!(manager.resolver().has_certificate());
    }

    #[test]
    fn test_load_cached_skips_cert_missing_a_domain() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(settings(dir.path().to_str().unwrap())).unwrap();

        let cert = self_signed(&["home.example.com"]);
        manager
            .save_cert(&cert.cert.pem(), &cert.key_pair.serialize_pem())
            .unwrap();

        assert!(!manager.load_cached());
        assert!(!manager.resolver().has_certificate());
    }

    #[tokio::test]
    async fn test_run_keeps_retrying_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let mut settings = settings(dir.path().to_str().unwrap());
        settings.directory_url = Some(format!("http://{}/directory", closed));
        let manager = Arc::new(AcmeManager::new(settings).unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run(shutdown_rx).await }
        });

        // The first issuance fails against the unreachable directory
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!task.is_finished());
        assert!(!manager.resolver().has_certificate());

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run returns after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_returns_when_already_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AcmeManager::new(settings(dir.path().to_str().unwrap())).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        manager.run(shutdown_rx).await.unwrap();
        assert!(!dir.path().join("account.json").exists());
    }

    #[test]
    fn test_manager_requires_domains() {
        let mut settings = settings("/tmp/acme_test");
        settings.domains.clear();
        assert!(matches!(AcmeManager::new(settings), Err(EngineError::Acme(_))));
    }

    #[test]
    fn test_validate_cache_dir() {
        assert!(validate_cache_dir("../etc/passwd").is_err());
        assert!(validate_cache_dir("foo/../../bar").is_err());
        assert!(validate_cache_dir("/tmp/acme").is_ok());
        assert!(validate_cache_dir("./acme_cache").is_ok());
    }
}
