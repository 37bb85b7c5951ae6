//! Origin round trips.
//!
//! # Responsibilities
//! - Forward a (possibly conditional) request to the origin server
//! - Hand the response body back as a stream
//!
//! # Design Decisions
//! - Every request is an independent round trip; idle connections are never pooled
//! - No retries: a failed round trip is reported once
//! - The client ignores proxy environment variables so it never loops back
//!   into this proxy

use std::future::Future;
use std::time::Duration;

use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use futures_util::TryStreamExt;
use thiserror::Error;
use tokio_util::io::StreamReader;

use crate::cache::BodyReader;
use crate::config::UpstreamConfig;

/// Errors raised by an origin round trip.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request could not be turned into an origin request.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    /// Connecting to or talking with the origin failed.
    #[error("{0}")]
    Transport(String),

    /// The origin did not answer in time.
    #[error("upstream timed out: {0}")]
    Timeout(String),
}

/// Response returned by the origin.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyReader,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs one origin round trip per call.
pub trait Upstream: Send + Sync {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> impl Future<Output = Result<UpstreamResponse, UpstreamError>> + Send;
}

/// Origin client backed by reqwest, without connection reuse.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Build a client with the configured timeouts.
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else if err.is_builder() {
            UpstreamError::InvalidRequest(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

impl Upstream for HttpUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<UpstreamResponse, UpstreamError> {
        let (parts, body) = request.into_parts();
        if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
            return Err(UpstreamError::InvalidRequest(format!(
                "request target {} is not absolute",
                parts.uri
            )));
        }

        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let stream = response.bytes_stream().map_err(std::io::Error::other);

        Ok(UpstreamResponse {
            status,
            headers,
            body: Box::new(StreamReader::new(Box::pin(stream))),
        })
    }
}
