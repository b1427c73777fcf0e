//! rustls setup for the engine's TLS listeners

use crate::engine::EngineError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// ALPN protocols offered on TLS listeners
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Tls(format!("failed to parse certificates from {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(EngineError::Tls(format!("no certificates found in {}", path)));
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| EngineError::Tls(format!("failed to parse key from {}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(EngineError::Tls(format!("no private key found in {}", path)))
}

/// Acceptor serving the certificate and key from the given PEM files
pub fn manual_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, EngineError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EngineError::Tls(e.to_string()))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Acceptor whose certificates come from `resolver`; `extra_alpn` is offered ahead
/// of the HTTP protocols
pub fn resolver_acceptor(resolver: Arc<dyn ResolvesServerCert>, extra_alpn: &[&[u8]]) -> TlsAcceptor {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = extra_alpn
        .iter()
        .chain(ALPN_PROTOCOLS.iter())
        .map(|p| p.to_vec())
        .collect();

    TlsAcceptor::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_pem(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed() -> (NamedTempFile, NamedTempFile) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (write_pem(&cert.pem()), write_pem(&key_pair.serialize_pem()))
    }

    #[test]
    fn test_manual_acceptor_from_pem_files() {
        let (cert, key) = self_signed();
        let acceptor = manual_acceptor(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
        );
        assert!(acceptor.is_ok());
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs("/nonexistent/cert.pem").unwrap_err();
        assert!(matches!(err, EngineError::Tls(_)));
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn test_key_file_without_key() {
        let (cert, _key) = self_signed();
        let err = load_key(cert.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_cert_file_without_certs() {
        let file = write_pem("not a pem file\n");
        let err = load_certs(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
