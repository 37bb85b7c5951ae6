//! Sequential request loop over a terminated tunnel.

use axum::http::uri::{Authority, Scheme};
use axum::http::{Request, StatusCode, Uri};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::cache::Cache;
use crate::error::ProxyError;
use crate::http::codec::{read_request, DecodeError};
use crate::http::headers;
use crate::http::processor::{CachedRequestInfo, CachingProcessor};
use crate::http::request::ensure_request_id;
use crate::http::upstream::Upstream;
use crate::http::writer::{RawWriter, ResponseWriter};
use crate::tunnel::TunnelError;

/// Decode requests from `stream` one at a time and answer each before
/// reading the next.
///
/// Returns `Ok` on a clean end of stream or after a `Connection: close`
/// request. Decode failures and broken writes end the loop with an error.
pub async fn run_request_loop<S, C, U>(
    stream: S,
    target: &Authority,
    processor: &CachingProcessor<C, U>,
    max_body_bytes: usize,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    C: Cache<CachedRequestInfo>,
    U: Upstream,
{
    let mut stream = BufReader::new(stream);
    let mut served = 0usize;

    let result = loop {
        let request = match read_request(&mut stream, max_body_bytes).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(target_host = %target, served, "Tunnel reached end of stream");
                break Ok(());
            }
            Err(err) => {
                if !matches!(err, DecodeError::Io(_) | DecodeError::UnexpectedEof) {
                    RawWriter::new(&mut stream).error(&err, StatusCode::BAD_REQUEST).await;
                }
                break Err(TunnelError::Decode(err).into());
            }
        };

        let close = headers::wants_close(request.headers());
        let mut request = absolute_request(request, target);
        let request_id = ensure_request_id(request.headers_mut());
        tracing::debug!(
            target_host = %target,
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
            "Tunnel request decoded"
        );

        let mut writer = RawWriter::new(&mut stream);
        if let Err(err) = processor.process(&mut writer, request).await {
            if err.is_connection_fatal() {
                break Err(err);
            }
        }
        served += 1;

        if close {
            tracing::debug!(target_host = %target, served, "Client asked to close tunnel");
            break Ok(());
        }
    };

    // Best effort: TLS streams send close_notify here.
    let _ = stream.get_mut().shutdown().await;
    result
}

/// Rewrite an origin-form target into `https://<connect authority><path>`.
/// Absolute-form targets are kept as sent.
pub fn absolute_request(request: Request<Bytes>, target: &Authority) -> Request<Bytes> {
    if request.uri().scheme().is_some() && request.uri().authority().is_some() {
        return request;
    }

    let (mut parts, body) = request.into_parts();
    let authority = match target.port_u16() {
        Some(443) => target.host().to_string(),
        _ => target.as_str().to_string(),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    match Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
    {
        Ok(uri) => parts.uri = uri,
        Err(e) => tracing::debug!(error = %e, "Keeping tunnel request target as sent"),
    }
    Request::from_parts(parts, body)
}
