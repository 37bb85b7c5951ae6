//! Cache policy shared with the request processor.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::schema::CacheConfig;

/// The caching knobs the processor consults on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Cache eligible responses even when the origin forbids storage.
    pub always_cache: bool,
    /// Lifetime given to entries without an explicit expiry, and to entries
    /// refreshed by a 304 revalidation.
    pub default_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            always_cache: config.always_cache,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
        }
    }
}

/// Shared handle to the current policy; reloads swap it atomically.
#[derive(Debug, Clone)]
pub struct PolicyHandle(Arc<ArcSwap<CachePolicy>>);

impl PolicyHandle {
    pub fn new(policy: CachePolicy) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(policy)))
    }

    /// Snapshot of the current policy.
    pub fn load(&self) -> CachePolicy {
        **self.0.load()
    }

    /// Replace the policy seen by subsequent requests.
    pub fn store(&self, policy: CachePolicy) {
        self.0.store(Arc::new(policy));
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_stores() {
        let handle = PolicyHandle::default();
        let processor_view = handle.clone();
        assert!(!processor_view.load().always_cache);

        handle.store(CachePolicy {
            always_cache: true,
            default_ttl: Duration::from_secs(5),
        });

        assert!(processor_view.load().always_cache);
        assert_eq!(processor_view.load().default_ttl, Duration::from_secs(5));
    }
}
