//! In-memory fakes shared by unit tests.

use std::collections::VecDeque;
use std::io::{self, Cursor};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::cache::{BodyReader, Cache, CacheError, CacheKey, Entry, EntryMetadata, MemoryCache};
use crate::http::upstream::{Upstream, UpstreamError, UpstreamResponse};
use crate::http::writer::{ResponseBody, ResponseWriter};

/// One canned origin reply.
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: &'static [u8],
}

impl Reply {
    pub fn new(status: StatusCode, headers: &[(&'static str, &'static str)], body: &'static [u8]) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        Self { status, headers: map, body }
    }
}

/// Upstream that answers from a script and records what it was sent.
#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    replies: Arc<Mutex<VecDeque<Result<Reply, UpstreamError>>>>,
    seen: Arc<Mutex<Vec<Request<Bytes>>>>,
}

impl ScriptedUpstream {
    pub fn push(&self, reply: Reply) -> &Self {
        self.replies.lock().unwrap().push_back(Ok(reply));
        self
    }

    pub fn push_error(&self, err: UpstreamError) -> &Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Headers of the `n`th request sent to the origin.
    pub fn request_headers(&self, n: usize) -> HeaderMap {
        self.seen.lock().unwrap()[n].headers().clone()
    }

    pub fn request_uri(&self, n: usize) -> String {
        self.seen.lock().unwrap()[n].uri().to_string()
    }
}

impl Upstream for ScriptedUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<UpstreamResponse, UpstreamError> {
        self.seen.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamError::Transport("script exhausted".into())))?;
        Ok(UpstreamResponse {
            status: reply.status,
            headers: reply.headers,
            body: Box::new(Cursor::new(reply.body)),
        })
    }
}

/// Writer that captures whatever the processor emits.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    pub headers: HeaderMap,
    pub status: Option<StatusCode>,
    pub body: Option<Vec<u8>>,
    pub error: Option<(StatusCode, String)>,
}

impl ResponseWriter for RecordingWriter {
    fn set_header(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    async fn write(&mut self, status: StatusCode, body: ResponseBody<'_>) -> io::Result<()> {
        self.status = Some(status);
        self.body = match body {
            ResponseBody::Empty => None,
            ResponseBody::Stream(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Some(buf)
            }
        };
        Ok(())
    }

    async fn error(&mut self, err: &(dyn std::error::Error + Send + Sync), status: StatusCode) {
        self.error = Some((status, err.to_string()));
    }
}

/// Cache operations a `FailingCache` can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Store,
    UpdateMetadata,
}

/// Memory cache that fails queued operations with a backend error, once each.
pub struct FailingCache<T> {
    inner: MemoryCache<T>,
    failures: Mutex<Vec<CacheOp>>,
}

impl<T> FailingCache<T> {
    pub fn new() -> Self {
        Self {
            inner: MemoryCache::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: CacheOp) -> &Self {
        self.failures.lock().unwrap().push(op);
        self
    }

    pub fn inner(&self) -> &MemoryCache<T> {
        &self.inner
    }

    fn check(&self, op: CacheOp) -> Result<(), CacheError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|queued| *queued == op) {
            Some(index) => {
                failures.remove(index);
                Err(CacheError::Backend(format!("{op:?} failed")))
            }
            None => Ok(()),
        }
    }
}

impl<T> Cache<T> for FailingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &CacheKey) -> Result<Entry<T>, CacheError> {
        self.check(CacheOp::Get)?;
        self.inner.get(key).await
    }

    async fn cache(
        &self,
        key: &CacheKey,
        data: BodyReader,
        expires: SystemTime,
        object: T,
    ) -> Result<Entry<T>, CacheError> {
        self.check(CacheOp::Store)?;
        self.inner.cache(key, data, expires, object).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    async fn update_metadata<F>(&self, key: &CacheKey, modifier: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut EntryMetadata<T>) + Send,
    {
        self.check(CacheOp::UpdateMetadata)?;
        self.inner.update_metadata(key, modifier).await
    }
}
