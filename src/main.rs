//! Caching MITM Proxy
//!
//! A forward proxy that terminates CONNECT tunnels with pre-issued leaf
//! certificates and serves repeat requests from a local HTTP cache.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────────────┐
//!                    │                  CACHING MITM PROXY                   │
//!                    │                                                       │
//!   Client ──────────┼─▶ net::listener ─▶ http::server ─┬─▶ axum fallback ──┐ │
//!                    │                                  │                   │ │
//!                    │                          CONNECT └─▶ tunnel ─▶ tls   │ │
//!                    │                                        │             │ │
//!                    │                                        ▼             ▼ │
//!                    │                              http::processor ◀───────┘ │
//!                    │                                │          │            │
//!                    │                          cache::Cache  http::upstream ─┼──▶ Origin
//!                    └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use caching_mitm_proxy::config::{load_config, ProxyConfig};
use caching_mitm_proxy::lifecycle::startup;
use caching_mitm_proxy::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "caching-mitm-proxy", version, about = "Caching MITM HTTP/TLS forward proxy")]
struct Args {
    /// Path to the TOML configuration file. Built-in defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_tracing(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "caching-mitm-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        config_file = ?args.config,
        "Configuration loaded"
    );

    startup::run(config, args.config.as_deref()).await?;
    Ok(())
}
