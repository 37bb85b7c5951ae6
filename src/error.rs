//! Crate-level error taxonomy.
//!
//! Every failure the request pipeline can hit is one of these variants. The
//! variant decides the status reported to the client before the error is
//! returned to the caller.

use axum::http::StatusCode;
use thiserror::Error;

use crate::cache::CacheError;
use crate::http::upstream::UpstreamError;
use crate::tunnel::TunnelError;

/// Errors produced while processing a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The cache backend failed on lookup, store or metadata update.
    #[error("cache error for key {key}: {source}")]
    Cache {
        key: String,
        #[source]
        source: CacheError,
    },

    /// The origin could not be reached or the transport failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] UpstreamError),

    /// The origin answered 304 although no validators from a cached entry were sent.
    #[error("received 304 Not Modified but no cached response exists for key {key}")]
    NotModifiedWithoutEntry { key: String },

    /// Writing the response to the client failed.
    #[error("failed to write response: {0}")]
    Write(#[source] std::io::Error),

    /// CONNECT tunnel setup or request loop failure.
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

impl ProxyError {
    /// Status reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection the request arrived on can no longer be used.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ProxyError::Write(_) | ProxyError::Tunnel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_bad_gateway() {
        let err = ProxyError::Upstream(UpstreamError::Transport("connection refused".into()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn consistency_faults_map_to_internal_error() {
        let err = ProxyError::NotModifiedWithoutEntry { key: "GET example.com/pkg.deb".into() };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("example.com/pkg.deb"));
    }

    #[test]
    fn write_failures_are_connection_fatal() {
        let err = ProxyError::Write(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_connection_fatal());
    }
}
