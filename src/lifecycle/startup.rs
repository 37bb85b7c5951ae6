//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Start background tasks (metrics, config watcher, signal handler)
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listener binds last (traffic only when ready)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::MemoryCache;
use crate::config::watcher::{apply_updates, ConfigWatcher};
use crate::config::{CachePolicy, PolicyHandle, ProxyConfig};
use crate::http::processor::CachingProcessor;
use crate::http::server::HttpServer;
use crate::http::upstream::{HttpUpstream, UpstreamError};
use crate::lifecycle::{signals, Shutdown};
use crate::net::{Listener, ListenerError};
use crate::observability::metrics;
use crate::tls::PemDirectoryAuthority;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),

    #[error("upstream client: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Build every subsystem from `config` and serve until a stop signal.
///
/// `config_path` is watched for cache policy changes when
/// `reload.watch_config` is set.
pub async fn run(config: ProxyConfig, config_path: Option<&Path>) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let policy = PolicyHandle::new(CachePolicy::from(&config.cache));

    let _watcher = match (config.reload.watch_config, config_path) {
        (true, Some(path)) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            tokio::spawn(apply_updates(updates, policy.clone()));
            Some(watcher)
        }
        (true, None) => {
            tracing::warn!("reload.watch_config is set but no config file was given");
            None
        }
        _ => None,
    };

    let processor = Arc::new(CachingProcessor::new(
        Arc::new(MemoryCache::with_limits(
            config.cache.max_entry_bytes,
            config.cache.max_total_bytes,
        )),
        HttpUpstream::new(&config.upstream)?,
        policy,
    ));
    let authority = Arc::new(PemDirectoryAuthority::new(&config.tls));

    tracing::info!(
        always_cache = config.cache.always_cache,
        default_ttl_secs = config.cache.default_ttl_secs,
        max_entry_bytes = config.cache.max_entry_bytes,
        max_total_bytes = config.cache.max_total_bytes,
        cert_dir = ?config.tls.cert_dir,
        "Subsystems initialized"
    );

    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    HttpServer::new(&config, processor, authority)
        .run(listener, shutdown)
        .await?;
    Ok(())
}
