//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → CachePolicy published through a PolicyHandle
//!
//! On change (reload.watch_config = true):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the CachePolicy
//!     → the processor observes it on the next request
//! ```
//!
//! # Design Decisions
//! - Only the cache policy is hot-reloadable; everything else is read once
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod policy;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use policy::{CachePolicy, PolicyHandle};
pub use schema::{
    CacheConfig, ListenerConfig, LogFormat, ObservabilityConfig, ProxyConfig, ReloadConfig,
    TlsConfig, UpstreamConfig,
};
pub use validation::ValidationError;
