//! Caching MITM HTTP/TLS forward proxy library.

// Core pipeline
pub mod cache;
pub mod directive;
pub mod http;
pub mod tls;
pub mod tunnel;

// Infrastructure
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;

#[cfg(test)]
mod testing;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
