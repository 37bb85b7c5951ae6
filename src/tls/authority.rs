//! Certificate authority backed by a directory of pre-issued PEM files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::config::TlsConfig;
use crate::tls::{CertAuthority, CertError, HostCertificate};

/// Serves `<cert_dir>/<host>.crt` + `<host>.key`, falling back to a default
/// pair (typically a wildcard leaf).
///
/// Per-host pairs are memoised by host. The default pair is loaded once and
/// shared, so unlisted host names never grow the memo.
#[derive(Debug)]
pub struct PemDirectoryAuthority {
    cert_dir: PathBuf,
    default_pair: Option<(PathBuf, PathBuf)>,
    default_certificate: OnceCell<Arc<HostCertificate>>,
    loaded: DashMap<String, Arc<HostCertificate>>,
}

impl PemDirectoryAuthority {
    pub fn new(config: &TlsConfig) -> Self {
        let default_pair = match (&config.default_cert, &config.default_key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        };
        Self {
            cert_dir: config.cert_dir.clone(),
            default_pair,
            default_certificate: OnceCell::new(),
            loaded: DashMap::new(),
        }
    }

    async fn host_pair(&self, host: &str) -> Option<(PathBuf, PathBuf)> {
        // Host names become file names; anything path-like is refused.
        if host.is_empty() || host.starts_with('.') || host.contains(['/', '\\']) {
            return None;
        }
        let cert = self.cert_dir.join(format!("{host}.crt"));
        let key = self.cert_dir.join(format!("{host}.key"));
        (is_file(&cert).await && is_file(&key).await).then_some((cert, key))
    }

    async fn default_certificate(&self) -> Result<Option<Arc<HostCertificate>>, CertError> {
        let Some((cert_path, key_path)) = &self.default_pair else {
            return Ok(None);
        };
        let certificate = self
            .default_certificate
            .get_or_try_init(|| async {
                let certificate = load_pair(cert_path, key_path).await?;
                tracing::debug!(cert = ?cert_path, "Loaded default leaf certificate");
                Ok::<_, CertError>(Arc::new(certificate))
            })
            .await?;
        Ok(Some(Arc::clone(certificate)))
    }
}

impl CertAuthority for PemDirectoryAuthority {
    async fn certificate_for_host(&self, host: &str) -> Result<Arc<HostCertificate>, CertError> {
        let host = host.to_ascii_lowercase();
        if let Some(found) = self.loaded.get(&host) {
            return Ok(Arc::clone(found.value()));
        }

        let Some((cert_path, key_path)) = self.host_pair(&host).await else {
            return self
                .default_certificate()
                .await?
                .ok_or(CertError::UnknownHost(host));
        };

        let certificate = Arc::new(load_pair(&cert_path, &key_path).await?);
        tracing::debug!(host = %host, cert = ?cert_path, "Loaded leaf certificate");
        self.loaded.insert(host, Arc::clone(&certificate));
        Ok(certificate)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}

/// Read a PEM certificate chain and its private key.
pub async fn load_pair(cert_path: &Path, key_path: &Path) -> Result<HostCertificate, CertError> {
    let cert_pem = read(cert_path).await?;
    let key_pem = read(key_path).await?;

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertError::NoCertificate(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| CertError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertError::NoPrivateKey(key_path.to_path_buf()))?;

    Ok(HostCertificate { chain, key })
}

async fn read(path: &Path) -> Result<Vec<u8>, CertError> {
    tokio::fs::read(path).await.map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })
}
