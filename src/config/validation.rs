//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, timeouts and the retry policy
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use axum::http::{uri::Authority, StatusCode};
use tracing_subscriber::filter::LevelFilter;

use crate::config::schema::ProxyConfig;
use crate::resilience::PolicyError;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every semantic constraint and report all violations.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address '{}'", config.listener.bind_address),
        ));
    }

    if config.upstream.address.parse::<Authority>().is_err() {
        errors.push(ValidationError::new(
            "upstream.address",
            format!("invalid authority '{}'", config.upstream.address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts.request_secs",
            "must be greater than zero",
        ));
    }

    let retry = &config.retry;
    if retry.attempts == 0 {
        errors.push(ValidationError::new(
            "retry",
            PolicyError::NoAttempts(retry.attempts).to_string(),
        ));
    }
    if retry.status_codes.is_empty() {
        errors.push(ValidationError::new("retry", PolicyError::NoStatusCodes.to_string()));
    }
    for &code in &retry.status_codes {
        if StatusCode::from_u16(code).is_err() {
            errors.push(ValidationError::new(
                "retry",
                PolicyError::InvalidStatusCode(code).to_string(),
            ));
        }
    }

    if retry.max_buffered_body_bytes == 0 {
        errors.push(ValidationError::new(
            "retry.max_buffered_body_bytes",
            "must be greater than zero",
        ));
    }

    if config.observability.log_level.to_ascii_lowercase().parse::<LevelFilter>().is_err() {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown log level '{}'", config.observability.log_level),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
