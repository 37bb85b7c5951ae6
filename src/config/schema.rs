//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the caching MITM proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Caching behaviour.
    pub cache: CacheConfig,

    /// Origin client settings.
    pub upstream: UpstreamConfig,

    /// Leaf certificates used to terminate CONNECT tunnels.
    pub tls: TlsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Hot reload settings.
    pub reload: ReloadConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3142").
    pub bind_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Seconds to wait for open connections to finish on shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3142".to_string(),
            max_connections: 1_024,
            drain_timeout_secs: 10,
        }
    }
}

/// Caching behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store every eligible response even when the origin forbids it.
    pub always_cache: bool,

    /// Lifetime of entries whose origin gave no explicit expiry, in seconds.
    pub default_ttl_secs: u64,

    /// Largest request body accepted from clients.
    pub max_request_body_bytes: usize,

    /// Largest response body kept in the cache. Bigger bodies are streamed
    /// to the client without being stored.
    pub max_entry_bytes: usize,

    /// Budget for all cached bodies together.
    pub max_total_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            always_cache: false,
            default_ttl_secs: 3_600,
            max_request_body_bytes: 8 * 1024 * 1024,
            max_entry_bytes: 256 * 1024 * 1024,
            max_total_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Origin client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Total time for one origin round trip in seconds.
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

/// Where pre-issued leaf certificates are found.
///
/// `<cert_dir>/<host>.crt` and `<cert_dir>/<host>.key` are tried first, then
/// the default pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding per-host PEM certificate/key pairs.
    pub cert_dir: PathBuf,

    /// Fallback certificate chain (PEM), e.g. a wildcard leaf.
    pub default_cert: Option<PathBuf>,

    /// Private key (PEM) for `default_cert`.
    pub default_key: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("certs"),
            default_cert: None,
            default_key: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter (e.g. "info" or "caching_mitm_proxy=debug").
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "caching_mitm_proxy=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Hot reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReloadConfig {
    /// Watch the config file and apply cache policy changes without restart.
    pub watch_config: bool,
}
