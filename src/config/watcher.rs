//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::policy::{CachePolicy, PolicyHandle};
use crate::config::schema::ProxyConfig;

/// Monitors the configuration file and forwards every valid revision.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!(path = ?path, "Config file change detected, reloading");
                    match load_config(&path) {
                        Ok(config) => {
                            let _ = tx.send(config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Apply reloaded configurations to the live cache policy.
///
/// Only the cache section is hot; listener, TLS and upstream changes need a
/// restart and are logged as ignored.
pub async fn apply_updates(mut updates: mpsc::UnboundedReceiver<ProxyConfig>, policy: PolicyHandle) {
    while let Some(config) = updates.recv().await {
        let next = CachePolicy::from(&config.cache);
        let previous = policy.load();
        if next == previous {
            tracing::debug!("Reloaded config leaves cache policy unchanged");
            continue;
        }
        policy.store(next);
        tracing::info!(
            always_cache = next.always_cache,
            default_ttl_secs = next.default_ttl.as_secs(),
            "Cache policy updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_swap_the_policy() {
        let policy = PolicyHandle::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(apply_updates(rx, policy.clone()));

        let mut config = ProxyConfig::default();
        config.cache.always_cache = true;
        config.cache.default_ttl_secs = 42;
        tx.send(config).unwrap();
        drop(tx);
        task.await.unwrap();

        let current = policy.load();
        assert!(current.always_cache);
        assert_eq!(current.default_ttl, Duration::from_secs(42));
    }
}
