//! Cache-control directive evaluation.
//!
//! # Responsibilities
//! - Parse `Cache-Control`, `Pragma` and `Expires` from a request or response
//! - Decide whether the message forbids storage
//! - Compute an explicit expiry when the message carries one
//! - Record which conditional-validator headers are present
//!
//! # Design Decisions
//! - Parsing never fails; malformed directives are ignored
//! - Header stripping is a pure function returning a new header map

use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap, HeaderName};

/// Conditional-request headers the proxy manages itself.
pub const CONDITIONAL_HEADERS: [HeaderName; 5] = [
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
];

/// Longest freshness lifetime honoured. Larger lifetimes are clamped to it.
pub const MAX_FRESHNESS: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `now + lifetime`, with the lifetime clamped to [`MAX_FRESHNESS`].
///
/// Never overflows: an unrepresentable instant falls back to `now`.
pub fn expiry_after(now: SystemTime, lifetime: Duration) -> SystemTime {
    now.checked_add(lifetime.min(MAX_FRESHNESS)).unwrap_or(now)
}

/// Explicit freshness information carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// `no-cache`: may be stored but must be revalidated before every use.
    Revalidate,
    /// `max-age` / `s-maxage`, relative to the moment the message is evaluated.
    MaxAge(Duration),
    /// Absolute `Expires` date.
    Until(SystemTime),
}

/// The conditional-validator headers present on a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    present: Vec<HeaderName>,
}

impl ConditionalHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            present: CONDITIONAL_HEADERS
                .iter()
                .filter(|name| headers.contains_key(*name))
                .cloned()
                .collect(),
        }
    }

    /// Whether an entity-tag validator (`If-None-Match` / `If-Match`) is present.
    pub fn has_entity_tag(&self) -> bool {
        self.present
            .iter()
            .any(|name| name == header::IF_NONE_MATCH || name == header::IF_MATCH)
    }

    /// Whether a date validator (`If-Modified-Since` / `If-Unmodified-Since`) is present.
    pub fn has_last_modified(&self) -> bool {
        self.present
            .iter()
            .any(|name| name == header::IF_MODIFIED_SINCE || name == header::IF_UNMODIFIED_SINCE)
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn names(&self) -> &[HeaderName] {
        &self.present
    }
}

/// Parsed caching intent of a single request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirective {
    no_store: bool,
    freshness: Option<Freshness>,
    conditional: ConditionalHeaders,
}

impl CacheDirective {
    /// Parse the caching headers of a message.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut no_store = false;
        let mut no_cache = false;
        let mut max_age = None;
        let mut s_maxage = None;

        let mut has_cache_control = false;
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            has_cache_control = true;

            for directive in value.split(',') {
                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => (name, Some(argument.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.trim().to_ascii_lowercase().as_str() {
                    "no-store" | "private" => no_store = true,
                    "no-cache" => no_cache = true,
                    "max-age" => max_age = argument.and_then(parse_seconds).or(max_age),
                    "s-maxage" => s_maxage = argument.and_then(parse_seconds).or(s_maxage),
                    _ => {}
                }
            }
        }

        // Pragma only counts for HTTP/1.0 peers that send no Cache-Control.
        if !has_cache_control {
            no_cache = headers
                .get_all(header::PRAGMA)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("no-cache")));
        }

        let expires = headers
            .get(header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v.trim()).ok());

        let freshness = if no_cache {
            Some(Freshness::Revalidate)
        } else if let Some(age) = s_maxage.or(max_age) {
            Some(Freshness::MaxAge(age))
        } else {
            expires.map(Freshness::Until)
        };

        Self {
            no_store,
            freshness,
            conditional: ConditionalHeaders::from_headers(headers),
        }
    }

    /// True unless the message explicitly forbids storage.
    pub fn should_cache(&self) -> bool {
        !self.no_store
    }

    /// The explicit expiry carried by the message, or `now + default_ttl`.
    pub fn expires_or_default(&self, default_ttl: Duration) -> SystemTime {
        self.expires_at(SystemTime::now(), default_ttl)
    }

    fn expires_at(&self, now: SystemTime, default_ttl: Duration) -> SystemTime {
        match self.freshness {
            Some(Freshness::Revalidate) => now,
            Some(Freshness::MaxAge(age)) => expiry_after(now, age),
            Some(Freshness::Until(at)) => at,
            None => expiry_after(now, default_ttl),
        }
    }

    /// Conditional-validator headers found on the message.
    pub fn conditional_headers(&self) -> &ConditionalHeaders {
        &self.conditional
    }

    /// Copy of `headers` without the conditional-validator headers found on
    /// the parsed message.
    pub fn remove_conditional_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut stripped = headers.clone();
        for name in self.conditional.names() {
            stripped.remove(name);
        }
        stripped
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}
