//! TLS termination for CONNECT tunnels.
//!
//! # Responsibilities
//! - Define the certificate authority contract used by the tunnel controller
//! - Build rustls server configs from a host's leaf certificate
//!
//! # Design Decisions
//! - Protocol floor is TLS 1.2; TLS 1.3 is preferred
//! - ALPN only offers http/1.1 since tunnels are decoded as HTTP/1.x
//! - The crypto provider is passed explicitly, never taken from process state

pub mod authority;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;

pub use authority::PemDirectoryAuthority;

/// Errors raised while obtaining or installing a host certificate.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("no certificate available for host {0}")]
    UnknownHost(String),

    #[error("invalid certificate: {0}")]
    Tls(#[from] rustls::Error),
}

/// A leaf certificate chain and its private key.
#[derive(Debug)]
pub struct HostCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for HostCertificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Supplies a certificate the client will accept for `host`.
pub trait CertAuthority: Send + Sync {
    fn certificate_for_host(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Arc<HostCertificate>, CertError>> + Send;
}

/// Server-side TLS configuration presenting `certificate`.
pub fn server_config(certificate: &HostCertificate) -> Result<Arc<ServerConfig>, CertError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certificate.chain.clone(), certificate.key.clone_key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/localhost.crt");
    const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/localhost.key");

    #[tokio::test]
    async fn builds_server_config_from_fixture() {
        let certificate = authority::load_pair(CERT.as_ref(), KEY.as_ref()).await.unwrap();
        let config = server_config(&certificate).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
