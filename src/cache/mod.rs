//! Cache abstraction subsystem.
//!
//! # Data Flow
//! ```text
//! request
//!     → key.rs (CacheKey from method, host, path, query)
//!     → Cache::get (Entry with body stream, staleness, metadata)
//!     → Cache::cache / Cache::update_metadata (store or refresh)
//! ```
//!
//! # Design Decisions
//! - The per-entry payload is a type parameter; each cache instance documents
//!   its concrete payload type
//! - A miss is a distinguished `CacheError::Miss`, not a fatal condition
//! - Staleness is computed by the backend from `expires` at lookup time
//! - Backends own per-key consistency: a lookup racing a store or metadata
//!   update sees the before or the after state, never a mix
//! - A backend may refuse an oversized body; it hands the whole body back in
//!   `CacheError::TooLarge` so the caller can still serve it

pub mod key;
pub mod memory;

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use thiserror::Error;
use tokio::io::AsyncRead;

pub use key::CacheKey;
pub use memory::MemoryCache;

/// Readable body stream handed out by the cache. Dropping it releases it.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors returned by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry is stored under the key.
    #[error("cache miss")]
    Miss,

    /// The entry to delete or update does not exist.
    #[error("cache entry not found")]
    NotFound,

    /// Reading the body to store failed.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The body is larger than the backend will store.
    #[error("body exceeds the {limit} byte entry limit")]
    TooLarge { limit: usize, body: RejectedBody },

    /// Backend-specific failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A body a backend declined to store, replayable from its first byte.
pub struct RejectedBody(Mutex<BodyReader>);

impl RejectedBody {
    pub fn new(body: BodyReader) -> Self {
        Self(Mutex::new(body))
    }

    pub fn into_inner(self) -> BodyReader {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RejectedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RejectedBody(..)")
    }
}

/// Metadata stored alongside every body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata<T> {
    /// Instant after which the entry is stale.
    pub expires: SystemTime,
    /// Per-entry payload chosen by the cache user.
    pub object: T,
}

impl<T> EntryMetadata<T> {
    /// Whether the entry is stale at `now`.
    pub fn is_stale_at(&self, now: SystemTime) -> bool {
        self.expires <= now
    }
}

/// Result of a lookup or store.
pub struct Entry<T> {
    /// Body stream, owned by the caller.
    pub data: BodyReader,
    /// Whether `metadata.expires` had passed when the entry was read.
    pub stale: bool,
    pub metadata: EntryMetadata<T>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("stale", &self.stale)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Key/value store for HTTP bodies with typed per-entry metadata.
pub trait Cache<T>: Send + Sync {
    /// Retrieve the entry stored under `key`, or `CacheError::Miss`.
    fn get(&self, key: &CacheKey) -> impl Future<Output = Result<Entry<T>, CacheError>> + Send;

    /// Store `data` under `key`, superseding any previous entry, and return
    /// the newly stored entry.
    fn cache(
        &self,
        key: &CacheKey,
        data: BodyReader,
        expires: SystemTime,
        object: T,
    ) -> impl Future<Output = Result<Entry<T>, CacheError>> + Send;

    /// Remove the entry under `key`, or `CacheError::NotFound`.
    fn delete(&self, key: &CacheKey) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Mutate the metadata of an existing entry in place.
    fn update_metadata<F>(
        &self,
        key: &CacheKey,
        modifier: F,
    ) -> impl Future<Output = Result<(), CacheError>> + Send
    where
        F: FnOnce(&mut EntryMetadata<T>) + Send;
}
