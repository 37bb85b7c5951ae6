//! Cache key derivation.
//!
//! A key identifies a logical resource: method, target host, path and query.
//! Caching and conditional headers never take part, so a revalidation and the
//! original request land on the same entry.

use axum::http::{header, request::Parts, HeaderMap, Method, Uri};

/// Deterministic identifier for a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    host: String,
    path: String,
    query: Option<String>,
}

impl CacheKey {
    /// Build a key from explicit components.
    pub fn new(method: Method, host: &str, path: &str, query: Option<&str>) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        Self {
            method,
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        }
    }

    /// Derive the key from request head parts.
    pub fn from_parts(parts: &Parts) -> Self {
        let host = target_host(&parts.uri, &parts.headers);
        Self::new(parts.method.clone(), &host, parts.uri.path(), parts.uri.query())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}{}", self.method, self.host, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

/// Host the request targets: the URI authority when absolute, else the Host header.
/// Default ports for the scheme are dropped so `host` and `host:443` agree.
fn target_host(uri: &Uri, headers: &HeaderMap) -> String {
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let default_port = match uri.scheme_str() {
        Some("http") => Some(":80"),
        Some("https") => Some(":443"),
        _ => None,
    };

    match default_port.and_then(|port| authority.strip_suffix(port)) {
        Some(host) => host.to_string(),
        None => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    fn key_of(request: Request<()>) -> CacheKey {
        let (parts, _) = request.into_parts();
        CacheKey::from_parts(&parts)
    }

    #[test]
    fn conditional_headers_do_not_change_the_key() {
        let plain = request(Method::GET, "http://deb.example.org/pool/pkg.deb");
        let conditional = Request::builder()
            .uri("http://deb.example.org/pool/pkg.deb")
            .header("if-none-match", "\"abc\"")
            .header("cache-control", "no-cache")
            .body(())
            .unwrap();

        assert_eq!(key_of(plain), key_of(conditional));
    }

    #[test]
    fn host_path_and_method_distinguish_keys() {
        let base = key_of(request(Method::GET, "http://a.example/pkg.deb"));
        let other_host = key_of(request(Method::GET, "http://b.example/pkg.deb"));
        let other_path = key_of(request(Method::GET, "http://a.example/other.deb"));
        let head = key_of(request(Method::HEAD, "http://a.example/pkg.deb"));
        let query = key_of(request(Method::GET, "http://a.example/pkg.deb?v=2"));

        assert_ne!(base, other_host);
        assert_ne!(base, other_path);
        assert_ne!(base, head);
        assert_ne!(base, query);
    }

    #[test]
    fn origin_form_uses_host_header() {
        let tunneled = Request::builder()
            .uri("/pkg.deb")
            .header("host", "Deb.Example.org")
            .body(())
            .unwrap();
        let absolute = request(Method::GET, "https://deb.example.org:443/pkg.deb");

        assert_eq!(key_of(tunneled), key_of(absolute));
    }

    #[test]
    fn display_is_readable() {
        let key = CacheKey::new(Method::GET, "example.com", "/pkg.deb", Some("arch=amd64"));
        assert_eq!(key.to_string(), "GET example.com/pkg.deb?arch=amd64");
    }
}
