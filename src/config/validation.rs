//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, connection limit > 0, TTL within bounds)
//! - Keep the per-entry cache limit within the total cache budget
//! - Check socket addresses parse
//! - Check the default certificate and key are configured together
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::directive::MAX_FRESHNESS;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("tls.default_cert and tls.default_key must be set together")]
    IncompleteDefaultCertificate,
}

/// Check `config` for semantic errors.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    let positive = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("cache.default_ttl_secs", config.cache.default_ttl_secs),
        ("cache.max_request_body_bytes", config.cache.max_request_body_bytes as u64),
        ("cache.max_entry_bytes", config.cache.max_entry_bytes as u64),
        ("cache.max_total_bytes", config.cache.max_total_bytes as u64),
        ("upstream.connect_timeout_secs", config.upstream.connect_timeout_secs),
        ("upstream.request_timeout_secs", config.upstream.request_timeout_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::MustBePositive { field });
        }
    }

    let max_ttl = MAX_FRESHNESS.as_secs();
    if config.cache.default_ttl_secs > max_ttl {
        errors.push(ValidationError::TooLarge {
            field: "cache.default_ttl_secs",
            max: max_ttl,
        });
    }

    if config.cache.max_entry_bytes > config.cache.max_total_bytes {
        errors.push(ValidationError::TooLarge {
            field: "cache.max_entry_bytes",
            max: config.cache.max_total_bytes as u64,
        });
    }

    if config.tls.default_cert.is_some() != config.tls.default_key.is_some() {
        errors.push(ValidationError::IncompleteDefaultCertificate);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
