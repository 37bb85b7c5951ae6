//! In-memory cache backend.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;

use crate::cache::{BodyReader, Cache, CacheError, CacheKey, Entry, EntryMetadata, RejectedBody};
use crate::observability::metrics;

/// Body and metadata live in one map slot so readers never see a torn pair.
#[derive(Debug, Clone)]
struct Slot<T> {
    body: Bytes,
    metadata: EntryMetadata<T>,
}

/// A concurrent cache keeping bodies in memory.
///
/// DashMap shards keep operations on distinct keys from blocking each other.
/// Bodies over `max_entry_bytes` are refused. When the stored bodies exceed
/// `max_total_bytes`, entries with the earliest expiry are evicted first.
#[derive(Debug)]
pub struct MemoryCache<T> {
    entries: DashMap<CacheKey, Slot<T>>,
    max_entry_bytes: usize,
    max_total_bytes: usize,
    total_bytes: AtomicUsize,
}

impl<T> MemoryCache<T> {
    /// Create an empty cache without size limits.
    pub fn new() -> Self {
        Self::with_limits(usize::MAX, usize::MAX)
    }

    pub fn with_limits(max_entry_bytes: usize, max_total_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entry_bytes,
            max_total_bytes,
            total_bytes: AtomicUsize::new(0),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Combined size of all stored bodies.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    fn evict_over_budget(&self, keep: &CacheKey) {
        while self.total_bytes() > self.max_total_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|slot| slot.key() != keep)
                .min_by_key(|slot| slot.value().metadata.expires)
                .map(|slot| slot.key().clone());
            let Some(victim) = victim else {
                break;
            };

            if let Some((_, slot)) = self.entries.remove(&victim) {
                self.total_bytes.fetch_sub(slot.body.len(), Ordering::Relaxed);
                metrics::record_cache_eviction();
                tracing::debug!(key = %victim, bytes = slot.body.len(), "Evicted cache entry");
            }
        }
    }
}

impl<T> Default for MemoryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn into_entry<T>(slot: Slot<T>, now: SystemTime) -> Entry<T> {
    Entry {
        stale: slot.metadata.is_stale_at(now),
        data: Box::new(Cursor::new(slot.body)),
        metadata: slot.metadata,
    }
}

impl<T> Cache<T> for MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Result<Entry<T>, CacheError> {
        let slot = self
            .entries
            .get(key)
            .map(|slot| slot.value().clone())
            .ok_or(CacheError::Miss)?;
        Ok(into_entry(slot, SystemTime::now()))
    }

    async fn cache(
        &self,
        key: &CacheKey,
        mut data: BodyReader,
        expires: SystemTime,
        object: T,
    ) -> Result<Entry<T>, CacheError> {
        let limit = self.max_entry_bytes.min(self.max_total_bytes);
        let mut body = Vec::new();
        (&mut data)
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut body)
            .await?;
        if body.len() > limit {
            let replay: BodyReader = Box::new(Cursor::new(body).chain(data));
            return Err(CacheError::TooLarge {
                limit,
                body: RejectedBody::new(replay),
            });
        }

        let slot = Slot {
            body: Bytes::from(body),
            metadata: EntryMetadata { expires, object },
        };
        // Bytes are counted before the slot becomes visible to replacements.
        self.total_bytes.fetch_add(slot.body.len(), Ordering::Relaxed);
        if let Some(previous) = self.entries.insert(key.clone(), slot.clone()) {
            self.total_bytes.fetch_sub(previous.body.len(), Ordering::Relaxed);
        }
        tracing::trace!(key = %key, bytes = slot.body.len(), "Stored cache entry");
        self.evict_over_budget(key);

        Ok(into_entry(slot, SystemTime::now()))
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let (_, slot) = self.entries.remove(key).ok_or(CacheError::NotFound)?;
        self.total_bytes.fetch_sub(slot.body.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn update_metadata<F>(&self, key: &CacheKey, modifier: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut EntryMetadata<T>) + Send,
    {
        let mut slot = self.entries.get_mut(key).ok_or(CacheError::NotFound)?;
        modifier(&mut slot.metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::time::Duration;

    fn key(path: &str) -> CacheKey {
        CacheKey::new(Method::GET, "deb.example.org", path, None)
    }

    async fn read_all(mut data: BodyReader) -> Vec<u8> {
        let mut out = Vec::new();
        data.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn miss_is_distinguished() {
        let cache: MemoryCache<String> = MemoryCache::new();
        assert!(matches!(cache.get(&key("/a")).await, Err(CacheError::Miss)));
    }

    #[tokio::test]
    async fn store_then_get_returns_what_was_stored() {
        let cache = MemoryCache::new();
        let expires = SystemTime::now() + Duration::from_secs(60);

        let stored = cache
            .cache(&key("/a"), Box::new(Cursor::new(b"payload".to_vec())), expires, "meta".to_string())
            .await
            .unwrap();
        assert!(!stored.stale);
        assert_eq!(read_all(stored.data).await, b"payload");

        let fetched = cache.get(&key("/a")).await.unwrap();
        assert!(!fetched.stale);
        assert_eq!(fetched.metadata, EntryMetadata { expires, object: "meta".to_string() });
        assert_eq!(read_all(fetched.data).await, b"payload");
    }

    #[tokio::test]
    async fn past_expiry_reports_stale() {
        let cache = MemoryCache::new();
        let expired = SystemTime::now() - Duration::from_secs(1);
        cache
            .cache(&key("/a"), Box::new(Cursor::new(Vec::new())), expired, ())
            .await
            .unwrap();

        assert!(cache.get(&key("/a")).await.unwrap().stale);
    }

    #[tokio::test]
    async fn update_metadata_refreshes_expiry() {
        let cache = MemoryCache::new();
        let expired = SystemTime::now() - Duration::from_secs(1);
        cache
            .cache(&key("/a"), Box::new(Cursor::new(b"x".to_vec())), expired, 1u32)
            .await
            .unwrap();

        cache
            .update_metadata(&key("/a"), |meta| {
                meta.expires = SystemTime::now() + Duration::from_secs(60);
                meta.object += 1;
            })
            .await
            .unwrap();

        let entry = cache.get(&key("/a")).await.unwrap();
        assert!(!entry.stale);
        assert_eq!(entry.metadata.object, 2);
    }

    #[tokio::test]
    async fn update_and_delete_of_missing_key_report_not_found() {
        let cache: MemoryCache<()> = MemoryCache::new();
        assert!(matches!(
            cache.update_metadata(&key("/missing"), |_| {}).await,
            Err(CacheError::NotFound)
        ));
        assert!(matches!(cache.delete(&key("/missing")).await, Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn new_store_supersedes_previous_entry() {
        let cache = MemoryCache::new();
        let expires = SystemTime::now() + Duration::from_secs(60);
        cache.cache(&key("/a"), Box::new(Cursor::new(b"old".to_vec())), expires, ()).await.unwrap();
        cache.cache(&key("/a"), Box::new(Cursor::new(b"new".to_vec())), expires, ()).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(read_all(cache.get(&key("/a")).await.unwrap().data).await, b"new");

        cache.delete(&key("/a")).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_refused_and_handed_back_whole() {
        let cache = MemoryCache::with_limits(4, 100);
        let expires = SystemTime::now() + Duration::from_secs(60);

        let result = cache
            .cache(&key("/big"), Box::new(Cursor::new(b"0123456789".to_vec())), expires, ())
            .await;
        let Err(CacheError::TooLarge { limit, body }) = result else {
            panic!("expected TooLarge");
        };
        assert_eq!(limit, 4);
        assert_eq!(read_all(body.into_inner()).await, b"0123456789");

        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert!(matches!(cache.get(&key("/big")).await, Err(CacheError::Miss)));
    }

    #[tokio::test]
    async fn body_exactly_at_the_limit_is_stored() {
        let cache = MemoryCache::with_limits(4, 100);
        let expires = SystemTime::now() + Duration::from_secs(60);
        cache
            .cache(&key("/a"), Box::new(Cursor::new(b"0123".to_vec())), expires, ())
            .await
            .unwrap();
        assert_eq!(cache.total_bytes(), 4);
    }

    #[tokio::test]
    async fn over_budget_evicts_earliest_expiry_first() {
        let cache = MemoryCache::with_limits(10, 10);
        let now = SystemTime::now();
        let body = || -> BodyReader { Box::new(Cursor::new(b"xxxx".to_vec())) };

        cache.cache(&key("/late"), body(), now + Duration::from_secs(300), ()).await.unwrap();
        cache.cache(&key("/early"), body(), now + Duration::from_secs(60), ()).await.unwrap();
        assert_eq!(cache.total_bytes(), 8);

        // Even with the earliest expiry of all, the entry just stored survives.
        cache.cache(&key("/new"), body(), now + Duration::from_secs(1), ()).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 8);
        assert!(matches!(cache.get(&key("/early")).await, Err(CacheError::Miss)));
        assert!(cache.get(&key("/late")).await.is_ok());
        assert!(cache.get(&key("/new")).await.is_ok());
    }

    #[tokio::test]
    async fn replacing_an_entry_releases_its_bytes() {
        let cache = MemoryCache::with_limits(10, 10);
        let expires = SystemTime::now() + Duration::from_secs(60);
        cache.cache(&key("/a"), Box::new(Cursor::new(b"12345678".to_vec())), expires, ()).await.unwrap();
        cache.cache(&key("/b"), Box::new(Cursor::new(b"12".to_vec())), expires, ()).await.unwrap();
        cache.cache(&key("/a"), Box::new(Cursor::new(b"1234".to_vec())), expires, ()).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 6);
    }
}
