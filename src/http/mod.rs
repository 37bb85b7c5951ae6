//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Client connection
//!     → server.rs (accept, CONNECT vs plain dispatch)
//!     → request.rs (request ID)
//!     → codec.rs (decode requests off a tunnel)
//!     → processor.rs (cache lookup, revalidation, store)
//!         → upstream.rs (origin round trip)
//!         → headers.rs (hop-by-hop and unsupported header filtering)
//!     → writer.rs (channel or raw response)
//!     → Send to client
//! ```

pub mod codec;
pub mod headers;
pub mod processor;
pub mod request;
pub mod server;
pub mod upstream;
pub mod writer;

pub use processor::{CachedRequestInfo, CachingProcessor};
pub use request::X_REQUEST_ID;
pub use server::HttpServer;
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamResponse};
pub use writer::{ChannelWriter, RawWriter, ResponseBody, ResponseWriter};
