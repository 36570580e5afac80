//! Certificate loading and mutual-TLS `rustls` config construction.
//!
//! Both the Agent and the Relay trust the same root CA and present a
//! client/server certificate signed by it; the connection factory in
//! `portbridge-connectivity` verifies the peer's certificate against
//! that same root on both ends.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse certificate(s) in {path}: {source}")]
    ParseCert {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse private key in {path}: {source}")]
    ParseKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("invalid root certificate: {0}")]
    InvalidRoot(#[source] rustls::Error),
    #[error("invalid server certificate or key: {0}")]
    InvalidServerCert(#[source] rustls::Error),
    #[error("invalid client certificate or key: {0}")]
    InvalidClientCert(#[source] rustls::Error),
    #[error("failed to build client certificate verifier: {0}")]
    VerifierBuild(String),
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Installs the process-wide default `rustls` crypto provider.
///
/// `rustls` 0.23 requires this before any config is built; safe to call
/// more than once, including concurrently from the Agent and Relay test
/// suites in the same process.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::ParseCert {
            path: path.display().to_string(),
            source,
        })
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertError::ParseKey {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| CertError::NoKey(path.display().to_string()))
}

pub fn load_root_store(ca_path: &Path) -> Result<RootCertStore, CertError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        store.add(cert).map_err(CertError::InvalidRoot)?;
    }
    Ok(store)
}

/// The PEM material needed to act as either end of the mutual-TLS
/// handshake: the shared root CA, and this endpoint's own leaf
/// certificate chain and private key.
#[derive(Clone)]
pub struct MutualTlsMaterial {
    pub root_ca: Arc<RootCertStore>,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key_path: std::path::PathBuf,
}

impl MutualTlsMaterial {
    pub fn load(
        root_ca_path: &Path,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, CertError> {
        Ok(Self {
            root_ca: Arc::new(load_root_store(root_ca_path)?),
            cert_chain: load_certs(cert_path)?,
            private_key_path: key_path.to_path_buf(),
        })
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, CertError> {
        load_private_key(&self.private_key_path)
    }
}

/// Builds a server-side config that requires and verifies a client
/// certificate signed by the shared root CA (used by the Relay's
/// control and transfer listeners).
pub fn build_mutual_tls_server_config(
    material: &MutualTlsMaterial,
) -> Result<rustls::ServerConfig, CertError> {
    ensure_crypto_provider();

    let verifier = rustls::server::WebPkiClientVerifier::builder(material.root_ca.clone())
        .build()
        .map_err(|e| CertError::VerifierBuild(e.to_string()))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.cert_chain.clone(), material.private_key()?)
        .map_err(CertError::InvalidServerCert)
}

/// Builds a client-side config that presents the same certificate for
/// mutual auth and verifies the server against the shared root CA
/// (used by the Agent's outbound control and transfer dials).
pub fn build_mutual_tls_client_config(
    material: &MutualTlsMaterial,
) -> Result<rustls::ClientConfig, CertError> {
    ensure_crypto_provider();

    rustls::ClientConfig::builder()
        .with_root_certificates((*material.root_ca).clone())
        .with_client_auth_cert(material.cert_chain.clone(), material.private_key()?)
        .map_err(CertError::InvalidClientCert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_certs(Path::new("/nonexistent/path/cert.pem")).unwrap_err();
        assert!(matches!(err, CertError::Open { .. }));
    }

    #[test]
    fn missing_key_file_is_an_error() {
        let err = load_private_key(Path::new("/nonexistent/path/key.pem")).unwrap_err();
        assert!(matches!(err, CertError::Open { .. }));
    }

    #[test]
    fn ensure_crypto_provider_is_idempotent() {
        ensure_crypto_provider();
        ensure_crypto_provider();
    }
}
