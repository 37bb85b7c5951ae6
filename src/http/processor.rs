//! Cache-aware request processing.
//!
//! # Responsibilities
//! - Derive the cache key and look the request up
//! - Serve fresh hits without contacting the origin
//! - Revalidate stale hits with the stored validators
//! - Decide whether an origin response is stored, then write it out
//!
//! # Design Decisions
//! - The processor owns conditional revalidation; client validators are stripped
//! - What is served after a store is read back from the new entry, so the
//!   client sees exactly what was cached
//! - No per-key locking: concurrent misses may both fetch and both store
//! - A body the backend refuses as too large is still served, just not stored
//! - Every error is reported to the writer before it is returned

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use bytes::Bytes;

use crate::cache::{BodyReader, Cache, CacheError, CacheKey, Entry};
use crate::config::{CachePolicy, PolicyHandle};
use crate::directive::{expiry_after, CacheDirective};
use crate::error::ProxyError;
use crate::http::headers;
use crate::http::request::request_id;
use crate::http::upstream::{Upstream, UpstreamError};
use crate::http::writer::{ResponseBody, ResponseWriter};
use crate::observability::metrics;

/// Validator state captured when a response is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRequestInfo {
    pub etag: Option<String>,
    pub last_modified: SystemTime,
    /// Origin response headers, replayed verbatim on a hit.
    pub headers: HeaderMap,
}

impl CachedRequestInfo {
    /// Capture validators from origin response headers. A missing or
    /// unparsable `Last-Modified` is recorded as now.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
            .unwrap_or_else(SystemTime::now);

        Self {
            etag,
            last_modified,
            headers: headers.clone(),
        }
    }

    /// `If-None-Match` / `If-Modified-Since` for revalidating this entry.
    pub fn conditional_headers(&self) -> HeaderMap {
        let mut conditional = HeaderMap::new();
        if let Some(etag) = self.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
            conditional.insert(header::IF_NONE_MATCH, etag);
        }
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(self.last_modified)) {
            conditional.insert(header::IF_MODIFIED_SINCE, date);
        }
        conditional
    }
}

/// Whether an origin response may be stored.
///
/// `always_cache` overrides only the origin's directive; the status must
/// still be 200 and the method GET or HEAD.
pub fn is_cacheable(
    policy: &CachePolicy,
    directive: &CacheDirective,
    status: StatusCode,
    method: &Method,
) -> bool {
    (policy.always_cache || directive.should_cache())
        && status == StatusCode::OK
        && (method == Method::GET || method == Method::HEAD)
}

fn has_body(method: &Method, status: StatusCode) -> bool {
    method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

fn cache_error(key: &CacheKey, source: CacheError) -> ProxyError {
    ProxyError::Cache {
        key: key.to_string(),
        source,
    }
}

/// Applies HTTP caching on top of a cache backend and an origin client.
pub struct CachingProcessor<C, U> {
    cache: Arc<C>,
    upstream: U,
    policy: PolicyHandle,
}

impl<C, U> CachingProcessor<C, U>
where
    C: Cache<CachedRequestInfo>,
    U: Upstream,
{
    pub fn new(cache: Arc<C>, upstream: U, policy: PolicyHandle) -> Self {
        Self {
            cache,
            upstream,
            policy,
        }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Process one request and write its response to `writer`.
    pub async fn process<W>(&self, writer: &mut W, request: Request<Bytes>) -> Result<(), ProxyError>
    where
        W: ResponseWriter,
    {
        let start_time = Instant::now();
        let method = request.method().clone();
        let request_id = request_id(request.headers()).unwrap_or_default();

        match self.handle(writer, request, &request_id).await {
            Ok(status) => {
                metrics::record_request(method.as_str(), status.as_u16(), start_time);
                Ok(())
            }
            Err(err) => {
                let status = err.status();
                tracing::warn!(
                    request_id = %request_id,
                    method = %method,
                    status = %status,
                    error = %err,
                    "Request failed"
                );
                // A broken writer cannot carry an error response.
                if !matches!(err, ProxyError::Write(_)) {
                    writer.error(&err, status).await;
                }
                metrics::record_request(method.as_str(), status.as_u16(), start_time);
                Err(err)
            }
        }
    }

    async fn handle<W>(
        &self,
        writer: &mut W,
        request: Request<Bytes>,
        request_id: &str,
    ) -> Result<StatusCode, ProxyError>
    where
        W: ResponseWriter,
    {
        let policy = self.policy.load();
        let (mut parts, body) = request.into_parts();

        let client_directive = CacheDirective::parse(&parts.headers);
        if !client_directive.conditional_headers().is_empty() {
            tracing::debug!(
                request_id = %request_id,
                entity_tag = client_directive.conditional_headers().has_entity_tag(),
                last_modified = client_directive.conditional_headers().has_last_modified(),
                headers = ?client_directive.conditional_headers().names(),
                "Dropping client conditional headers"
            );
        }
        parts.headers =
            headers::remove_unsupported(&client_directive.remove_conditional_headers(&parts.headers));

        let key = CacheKey::from_parts(&parts);
        let method = parts.method.clone();

        let mut cached = match self.cache.get(&key).await {
            Ok(entry) if !entry.stale => {
                metrics::record_cache_lookup("fresh");
                tracing::info!(request_id = %request_id, key = %key, "Serving fresh cache hit");
                return serve_entry(writer, entry, &method).await;
            }
            Ok(entry) => {
                metrics::record_cache_lookup("stale");
                let conditional = entry.metadata.object.conditional_headers();
                tracing::info!(
                    request_id = %request_id,
                    key = %key,
                    validators = ?conditional,
                    "Cache entry is stale, revalidating"
                );
                parts.headers.extend(conditional);
                Some(entry)
            }
            Err(CacheError::Miss) => {
                metrics::record_cache_lookup("miss");
                tracing::info!(request_id = %request_id, key = %key, "Cache miss");
                None
            }
            Err(source) => return Err(cache_error(&key, source)),
        };

        let sent_headers = parts.headers.clone();
        tracing::debug!(request_id = %request_id, uri = %parts.uri, "Contacting origin");
        let response = match self.upstream.send(Request::from_parts(parts, body)).await {
            Ok(response) => {
                metrics::record_upstream("ok");
                response
            }
            Err(err) => {
                metrics::record_upstream(match err {
                    UpstreamError::Timeout(_) => "timeout",
                    UpstreamError::InvalidRequest(_) => "invalid",
                    UpstreamError::Transport(_) => "error",
                });
                return Err(err.into());
            }
        };

        if response.status == StatusCode::NOT_MODIFIED {
            let Some(entry) = cached.take() else {
                tracing::error!(
                    request_id = %request_id,
                    key = %key,
                    headers = ?sent_headers,
                    "Origin answered 304 without a cached entry"
                );
                return Err(ProxyError::NotModifiedWithoutEntry {
                    key: key.to_string(),
                });
            };

            let expires = expiry_after(SystemTime::now(), policy.default_ttl);
            self.cache
                .update_metadata(&key, move |metadata| metadata.expires = expires)
                .await
                .map_err(|source| cache_error(&key, source))?;
            metrics::record_revalidation("not_modified");
            tracing::info!(request_id = %request_id, key = %key, "Revalidated, expiry extended");
            return serve_entry(writer, entry, &method).await;
        }

        if cached.take().is_some() {
            metrics::record_revalidation("modified");
            tracing::info!(request_id = %request_id, key = %key, status = %response.status, "Cached entry replaced by origin");
        }

        let origin_directive = CacheDirective::parse(&response.headers);
        let response_headers = headers::remove_hop_by_hop(&response.headers);

        if is_cacheable(&policy, &origin_directive, response.status, &method) {
            let info = CachedRequestInfo::from_headers(&response_headers);
            let expires = origin_directive.expires_or_default(policy.default_ttl);
            match self.cache.cache(&key, response.body, expires, info).await {
                Ok(entry) => {
                    metrics::record_cache_store();
                    tracing::info!(request_id = %request_id, key = %key, "Stored origin response");
                    return serve_entry(writer, entry, &method).await;
                }
                Err(CacheError::TooLarge { limit, body }) => {
                    tracing::info!(
                        request_id = %request_id,
                        key = %key,
                        limit,
                        "Origin response exceeds the cache entry limit, passing through"
                    );
                    return pass_through(writer, response.status, response_headers, body.into_inner(), &method)
                        .await;
                }
                Err(source) => return Err(cache_error(&key, source)),
            }
        }

        tracing::info!(
            request_id = %request_id,
            key = %key,
            status = %response.status,
            "Passing origin response through uncached"
        );
        pass_through(writer, response.status, response_headers, response.body, &method).await
    }
}

/// Write an origin response out without storing it.
async fn pass_through<W>(
    writer: &mut W,
    status: StatusCode,
    headers: HeaderMap,
    mut body: BodyReader,
    method: &Method,
) -> Result<StatusCode, ProxyError>
where
    W: ResponseWriter,
{
    writer.set_header(headers);
    let payload = if has_body(method, status) {
        ResponseBody::Stream(&mut *body)
    } else {
        ResponseBody::Empty
    };
    writer.write(status, payload).await.map_err(ProxyError::Write)?;
    Ok(status)
}

/// Write a cached entry out. The body is released when `entry` drops.
async fn serve_entry<W>(
    writer: &mut W,
    mut entry: Entry<CachedRequestInfo>,
    method: &Method,
) -> Result<StatusCode, ProxyError>
where
    W: ResponseWriter,
{
    writer.set_header(entry.metadata.object.headers.clone());
    let body = if method == Method::HEAD {
        ResponseBody::Empty
    } else {
        ResponseBody::Stream(&mut *entry.data)
    };
    writer
        .write(StatusCode::OK, body)
        .await
        .map_err(ProxyError::Write)?;
    Ok(StatusCode::OK)
}
