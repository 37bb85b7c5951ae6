//! Header filtering for forwarded requests and replayed responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers, including those named by `Connection`
//! - Strip request headers the proxy cannot honour (`Range`)
//!
//! # Design Decisions
//! - Pure functions: a header snapshot in, a new header map out
//! - Framing headers are always dropped; writers re-frame bodies themselves

use axum::http::{header, HeaderMap, HeaderName};

/// Whether `name` is a hop-by-hop header that must not be forwarded or cached.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy of `headers` without hop-by-hop headers.
pub fn remove_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named_by_connection: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || named_by_connection.contains(name) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Copy of `headers` without anything the proxy does not forward.
///
/// Partial content is not supported, so range requests are turned into full
/// requests whose response can be cached.
pub fn remove_unsupported(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = remove_hop_by_hop(headers);
    filtered.remove(header::RANGE);
    filtered
}

/// Whether the message asks for the connection to be closed after it.
pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
