//! Request identification.
//!
//! # Responsibilities
//! - Assign a UUID v4 request ID to every proxied request
//! - Honour an `x-request-id` supplied by the client
//!
//! # Design Decisions
//! - The ID is added as early as possible so every log line can carry it
//! - Tunnel requests bypass tower middleware, so they call
//!   `ensure_request_id` directly

use axum::http::{HeaderMap, HeaderValue, Request};
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Generates UUID v4 request IDs for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(TowerRequestId::new)
    }
}

/// Return the request ID in `headers`, inserting a fresh one if absent.
pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = request_id(headers) {
        return id;
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID, value);
    }
    id
}

/// The request ID in `headers`, if any.
pub fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
